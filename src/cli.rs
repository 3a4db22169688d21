use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Command-line surface of the `accelira` binary.
#[derive(Debug, Parser)]
#[command(name = "accelira", about = "Accelira performance testing tool", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a JavaScript test script
    Run {
        /// Path to the bundled test script
        script: PathBuf,
        /// Serve the live dashboard on 127.0.0.1:8080 while the test runs
        #[arg(long)]
        dashboard: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn help_carries_the_tool_marker() {
        let mut command = Cli::command();
        let help = command.render_long_help().to_string();
        assert!(help.contains("Accelira performance testing tool"));
    }

    #[test]
    fn run_accepts_a_script_path() {
        let cli = Cli::try_parse_from(["accelira", "run", "smoke.js"]).unwrap();
        match cli.command {
            Command::Run { script, dashboard } => {
                assert_eq!(script, PathBuf::from("smoke.js"));
                assert!(!dashboard);
            }
        }
    }
}
