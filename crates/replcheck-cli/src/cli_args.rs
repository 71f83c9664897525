use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};

use replcheck_runtime::parse_unit_name;

fn parse_port(value: &str) -> Result<u16, String> {
    let parsed = value
        .parse::<u16>()
        .map_err(|error| format!("failed to parse port: {error}"))?;
    if parsed == 0 {
        return Err("port must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliReportFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "replcheck",
    about = "Run Clojure and ClojureScript tests through a running nREPL server",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "REPLCHECK_HOST",
        help = "nREPL host; overrides the config file (default 127.0.0.1)"
    )]
    pub host: Option<String>,

    #[arg(
        long,
        env = "REPLCHECK_PORT",
        value_parser = parse_port,
        help = "nREPL port; when absent the config file and then port files are consulted"
    )]
    pub port: Option<u16>,

    #[arg(
        long = "port-file",
        env = "REPLCHECK_PORT_FILE",
        help = "File holding the nREPL port. Defaults to searching .nrepl-port then .shadow-cljs/nrepl.port"
    )]
    pub port_file: Option<PathBuf>,

    #[arg(
        long,
        env = "REPLCHECK_CONFIG",
        default_value = ".replcheck.json",
        help = "Runner config JSON (schema_version 1); a missing file means defaults"
    )]
    pub config: PathBuf,

    #[arg(
        long = "legacy-done",
        env = "REPLCHECK_LEGACY_DONE",
        default_value_t = false,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "Complete calls on any \"done\" frame instead of the one carrying the request id"
    )]
    pub legacy_done: bool,

    #[arg(
        long = "report-file",
        env = "REPLCHECK_REPORT_FILE",
        help = "Also write the rendered report to this path (atomic replace)"
    )]
    pub report_file: Option<PathBuf>,

    #[arg(
        long = "format",
        env = "REPLCHECK_FORMAT",
        value_enum,
        default_value_t = CliReportFormat::Text,
        help = "Report format for test commands"
    )]
    pub format: CliReportFormat,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Run clojure.test namespaces synchronously, one submission per namespace.
    Test {
        #[arg(required = true, value_parser = parse_unit_name)]
        units: Vec<String>,
    },
    /// Run cljs.test namespaces in a shadow-cljs build and poll for the result.
    CljsTest {
        #[arg(long, help = "shadow-cljs build id, e.g. app")]
        build: String,
        #[arg(required = true, value_parser = parse_unit_name)]
        units: Vec<String>,
    },
    /// Evaluate one form and print its output and value.
    Eval { code: String },
}
