use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::common::utils::parse_human_duration;

#[derive(Parser)]
pub struct CommonOpts {
    /// Enables more detailed log output
    #[arg(long, global = true, env = "SKEIN_DEBUG", help_heading("GLOBAL OPTIONS"))]
    pub debug: bool,
}

// Root CLI options
#[derive(Parser)]
#[command(author, about, version(crate::SKEIN_VERSION))]
#[command(propagate_version = true)]
#[command(help_expected = true)]
pub struct RootOptions {
    #[clap(flatten)]
    pub common: CommonOpts,

    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Parser)]
pub enum SubCommand {
    /// Submit a job from a job file and wait until it ends
    Submit(SubmitOpts),
    /// Validate a job file and print the resolved container specifications
    Check(CheckOpts),
}

#[derive(Parser)]
pub struct SubmitOpts {
    /// Path to a TOML job file
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub job_file: PathBuf,

    /// Name of the job (a `[jobs.<name>]` table of the job file)
    pub job_name: String,

    /// Client-side timeout, overrides the timeout of the job file.
    /// `0` disables the timeout.
    #[arg(long, value_parser = parse_human_duration)]
    pub timeout: Option<Duration>,

    /// Kill the application when the timeout expires
    #[arg(long)]
    pub kill_on_timeout: bool,

    /// Directory where container working directories are created
    #[arg(long, value_hint = clap::ValueHint::DirPath)]
    pub work_dir: Option<PathBuf>,

    /// Name of a cluster node. Can be used multiple times.
    /// The local hostname is used when no node is given.
    #[arg(long = "node")]
    pub nodes: Vec<String>,
}

#[derive(Parser)]
pub struct CheckOpts {
    /// Path to a TOML job file
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub job_file: PathBuf,

    /// Only check this job. All jobs of the file are checked when omitted.
    pub job_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::{RootOptions, SubCommand};
    use clap::Parser;
    use std::time::Duration;

    #[test]
    fn parse_submit() {
        let opts = RootOptions::try_parse_from([
            "skein",
            "--debug",
            "submit",
            "jobs.toml",
            "train",
            "--timeout",
            "2m",
            "--node",
            "a",
            "--node",
            "b",
        ])
        .unwrap();
        assert!(opts.common.debug);
        match opts.subcmd {
            SubCommand::Submit(submit) => {
                assert_eq!(submit.job_name, "train");
                assert_eq!(submit.timeout, Some(Duration::from_secs(120)));
                assert!(!submit.kill_on_timeout);
                assert_eq!(submit.nodes, vec!["a".to_string(), "b".to_string()]);
                assert!(submit.work_dir.is_none());
            }
            SubCommand::Check(_) => panic!("Expected submit"),
        }
    }

    #[test]
    fn parse_check_without_job() {
        let opts = RootOptions::try_parse_from(["skein", "check", "jobs.toml"]).unwrap();
        match opts.subcmd {
            SubCommand::Check(check) => assert!(check.job_name.is_none()),
            SubCommand::Submit(_) => panic!("Expected check"),
        }
    }

    #[test]
    fn reject_invalid_timeout() {
        assert!(
            RootOptions::try_parse_from(["skein", "submit", "jobs.toml", "a", "--timeout", "x"])
                .is_err()
        );
    }
}
