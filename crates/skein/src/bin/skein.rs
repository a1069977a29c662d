use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use clap::error::ErrorKind;

use skein::client::submit::{EXIT_INVALID_INVOCATION, SubmitOptions, submit_and_wait};
use skein::common::cli::{CheckOpts, RootOptions, SubCommand, SubmitOpts};
use skein::common::setup::setup_logging;
use skein::job::defs::load_job_file;
use skein::local::{LocalCluster, LocalClusterConfig};
use skein::master::config::get_client_poll_period;

// Commands

async fn command_submit(opts: SubmitOpts) -> anyhow::Result<i32> {
    let mut job = load_job_file(&opts.job_file)?.into_job(&opts.job_name)?;
    if let Some(timeout) = opts.timeout {
        job.timeout = Some(timeout);
    }

    let work_dir = opts
        .work_dir
        .unwrap_or_else(|| default_work_dir(std::process::id()));
    let mut config = LocalClusterConfig::new(work_dir);
    if !opts.nodes.is_empty() {
        config.nodes = opts.nodes;
    }
    log::debug!("Container working directories are created in {:?}", config.work_dir);

    let cluster = Arc::new(LocalCluster::new(config));
    let options = SubmitOptions {
        poll_period: get_client_poll_period(),
        kill_on_timeout: opts.kill_on_timeout,
    };
    let interrupt = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            log::error!("Cannot listen for Ctrl-C: {error}");
            futures::future::pending::<()>().await;
        }
    };
    Ok(submit_and_wait(cluster, job, options, interrupt).await)
}

fn command_check(opts: CheckOpts) -> anyhow::Result<()> {
    let file = load_job_file(&opts.job_file)?;
    let jobs = match opts.job_name {
        Some(name) => vec![file.into_job(&name)?],
        None => file.into_jobs()?,
    };
    for job in jobs {
        println!("# {}", job.name);
        println!("{}", serde_json::to_string_pretty(&job.containers)?);
    }
    Ok(())
}

fn default_work_dir(pid: u32) -> PathBuf {
    std::env::temp_dir().join(format!("skein-{pid}"))
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let top_opts = match RootOptions::try_parse() {
        Ok(opts) => opts,
        Err(error) => {
            let code = match error.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EXIT_INVALID_INVOCATION,
            };
            let _ = error.print();
            std::process::exit(code);
        }
    };

    setup_logging(top_opts.common.debug);

    let result = match top_opts.subcmd {
        SubCommand::Submit(opts) => command_submit(opts).await,
        SubCommand::Check(opts) => command_check(opts).map(|_| 0),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            log::error!("{error:?}");
            std::process::exit(1);
        }
    }
}
