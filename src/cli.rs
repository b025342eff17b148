use std::path::PathBuf;

use clap::{Parser, ValueEnum};

const VERSION: &str = env!("HOSTAGENT_VERSION");

/// Top-level CLI definition for the `hostagent` binary.
#[derive(Debug, Parser)]
#[command(
    name = "hostagent",
    version = VERSION,
    about = "Runs and supervises one QEMU instance, reporting its status as JSON lines on stdout."
)]
pub struct Cli {
    /// Name of the instance directory to run.
    #[arg(value_name = "INSTANCE")]
    pub instance: String,

    #[arg(
        long,
        value_name = "DIR",
        help = "Directory holding instances. Defaults to $HOSTAGENT_HOME, then ~/.hostagent"
    )]
    pub home: Option<PathBuf>,

    #[arg(
        long,
        value_enum,
        value_name = "FORMAT",
        default_value_t = LogFormat::Json,
        help = "Format of the diagnostic log written to stderr"
    )]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_json_logs() {
        let cli = Cli::try_parse_from(["hostagent", "default"]).unwrap();
        assert_eq!(cli.instance, "default");
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(cli.home.is_none());
    }

    #[test]
    fn accepts_home_and_text_logs() {
        let cli = Cli::try_parse_from([
            "hostagent",
            "--home",
            "/srv/vms",
            "--log-format",
            "text",
            "dev",
        ])
        .unwrap();
        assert_eq!(cli.home, Some(PathBuf::from("/srv/vms")));
        assert_eq!(cli.log_format, LogFormat::Text);
    }

    #[test]
    fn instance_is_required() {
        assert!(Cli::try_parse_from(["hostagent"]).is_err());
    }
}
