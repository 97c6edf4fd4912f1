//! Purpose: `tabula` CLI entry point.
//! Role: Binary crate root; parses args, runs one command, emits JSON on stdout.
//! Invariants: Every command prints exactly one JSON result on success.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: All table access goes through `api::Database` (directory lock + atomic flush).
#![allow(clippy::result_large_err)]
use std::ffi::OsString;
use std::io::{self, IsTerminal};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind};
use serde_json::{Value, json};

mod command_dispatch;
mod serve;
mod table_info_json;

use table_info_json::{error_json, rows_json, table_info_json};
use tabula::api::{
    Database, Error, ErrorKind, ExportFormat, Filter, Record, Schema, default_table_dir,
    to_exit_code,
};

const DEFAULT_BIND: &str = "127.0.0.1:9800";
const DEFAULT_MAX_BODY_BYTES: u64 = 1024 * 1024;

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse_from(normalize_args(std::env::args_os())) {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint(clap_error_hint(&err)));
            }
        },
    };

    let table_dir = cli.dir.unwrap_or_else(default_table_dir);

    command_dispatch::dispatch_command(cli.command, table_dir)
        .map_err(add_corrupt_hint)
        .map_err(add_io_hint)
        .map_err(add_internal_hint)
}

fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .map(|arg| {
            let replacement = arg.to_str().and_then(|value| match value {
                "---help" => Some("--help"),
                "---version" => Some("--version"),
                _ => None,
            });
            replacement.map(OsString::from).unwrap_or(arg)
        })
        .collect()
}

#[derive(Parser)]
#[command(
    name = "tabula",
    version,
    about = "Schema-checked JSON tables on local disk",
    long_about = None,
    after_help = r#"EXAMPLES
  $ tabula table create users --schema '{"id":"int","name":"str"}'
  $ tabula insert users '{"id": 1, "name": "Alice"}'
  $ tabula select users --filter '{"id": 1}'
  $ tabula update users --filter '{"id": 1}' --set '{"name": "Alicia"}'
  $ tabula delete users --filter '{"id": 1}'
  $ tabula backup users
  $ tabula serve

NOTES
  - Default location: ~/.tabula/tables (override with --dir)
  - One process at a time owns a table directory"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        help = "Table directory (default: ~/.tabula/tables)",
        value_hint = ValueHint::DirPath
    )]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, Default, ValueEnum)]
enum ExportFormatCli {
    #[default]
    Csv,
    Tsv,
}

impl From<ExportFormatCli> for ExportFormat {
    fn from(value: ExportFormatCli) -> Self {
        match value {
            ExportFormatCli::Csv => ExportFormat::Csv,
            ExportFormatCli::Tsv => ExportFormat::Tsv,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(arg_required_else_help = true, about = "Manage table files")]
    Table {
        #[command(subcommand)]
        command: TableCommand,
    },
    #[command(
        arg_required_else_help = true,
        about = "Insert one record",
        after_help = r#"EXAMPLES
  $ tabula insert users '{"id": 3, "name": "Charlie"}'
  $ tabula insert users --key id '{"id": 3}'     # reject if id 3 exists"#
    )]
    Insert {
        #[arg(help = "Table name")]
        table: String,
        #[arg(help = "Record as a JSON object")]
        data: String,
        #[arg(long, value_name = "COLUMN", help = "Reject the record if COLUMN already holds its value")]
        key: Option<String>,
    },
    #[command(arg_required_else_help = true, about = "Print records matching a filter")]
    Select {
        #[arg(help = "Table name")]
        table: String,
        #[arg(long, value_name = "JSON", help = "Equality filter object (default: all rows)")]
        filter: Option<String>,
    },
    #[command(arg_required_else_help = true, about = "Merge fields into matching records")]
    Update {
        #[arg(help = "Table name")]
        table: String,
        #[arg(long, value_name = "JSON", help = "Equality filter object (default: all rows)")]
        filter: Option<String>,
        #[arg(long = "set", value_name = "JSON", help = "Fields to merge into each match")]
        set: String,
    },
    #[command(arg_required_else_help = true, about = "Remove matching records")]
    Delete {
        #[arg(help = "Table name")]
        table: String,
        #[arg(long, value_name = "JSON", help = "Equality filter object (default: all rows)")]
        filter: Option<String>,
    },
    #[command(arg_required_else_help = true, about = "Write a timestamped copy of a table file")]
    Backup {
        #[arg(help = "Table name")]
        table: String,
    },
    #[command(arg_required_else_help = true, about = "Export committed rows as CSV or TSV")]
    Export {
        #[arg(help = "Table name")]
        table: String,
        #[arg(help = "Output file path", value_hint = ValueHint::FilePath)]
        path: PathBuf,
        #[arg(long, value_enum, default_value = "csv", help = "Output format: csv|tsv")]
        format: ExportFormatCli,
    },
    #[command(about = "Serve tables over HTTP/JSON")]
    Serve(ServeRunArgs),
}

#[derive(Subcommand)]
enum TableCommand {
    #[command(about = "Create an empty table")]
    Create {
        #[arg(help = "Table name")]
        name: String,
        #[arg(long, value_name = "JSON", help = "Schema object, e.g. '{\"id\":\"int\"}'")]
        schema: Option<String>,
        #[arg(long, requires = "schema", help = "Reject fields the schema does not declare")]
        strict: bool,
    },
    #[command(about = "List table files in the directory")]
    List,
    #[command(about = "Delete a table file")]
    Drop {
        #[arg(help = "Table name")]
        name: String,
    },
    #[command(about = "Show table metadata")]
    Info {
        #[arg(help = "Table name")]
        name: String,
    },
}

#[derive(Args)]
struct ServeRunArgs {
    #[arg(long, default_value = DEFAULT_BIND, help = "Bind address")]
    bind: String,
    #[arg(long, help = "Bearer token for auth (dev-only; prefer --token-file)")]
    token: Option<String>,
    #[arg(long, value_name = "PATH", help = "Read bearer token from file", value_hint = ValueHint::FilePath)]
    token_file: Option<PathBuf>,
    #[arg(long, help = "Allow non-loopback binds (requires a token)")]
    allow_non_loopback: bool,
    #[arg(long, default_value_t = DEFAULT_MAX_BODY_BYTES, help = "Max request body size in bytes")]
    max_body_bytes: u64,
}

fn serve_config_from_run_args(run: ServeRunArgs, table_dir: &Path) -> Result<serve::ServeConfig, Error> {
    let bind: SocketAddr = run.bind.parse().map_err(|_| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid bind address")
            .with_hint("Use a host:port value like 127.0.0.1:9800.")
    })?;
    if run.token.is_some() && run.token_file.is_some() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--token cannot be combined with --token-file")
            .with_hint("Use one source for the bearer token."));
    }
    let token = match run.token_file {
        Some(path) => Some(read_token_file(&path)?),
        None => run.token,
    };
    Ok(serve::ServeConfig {
        bind,
        table_dir: table_dir.to_path_buf(),
        token,
        allow_non_loopback: run.allow_non_loopback,
        max_body_bytes: run.max_body_bytes,
    })
}

fn read_token_file(path: &Path) -> Result<String, Error> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("failed to read token file")
            .with_path(path)
            .with_source(err)
    })?;
    let token = raw.trim().to_string();
    if token.is_empty() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("token file is empty")
            .with_path(path));
    }
    Ok(token)
}

fn parse_inline_json(data: &str) -> Result<Value, Error> {
    serde_json::from_str(data).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid json")
            .with_hint("Provide a single JSON object (e.g. '{\"id\":1}').")
            .with_source(err)
    })
}

fn parse_record(data: &str) -> Result<Record, Error> {
    Record::from_json(parse_inline_json(data)?)
}

fn parse_filter(data: Option<&str>) -> Result<Filter, Error> {
    match data {
        Some(data) => parse_record(data),
        None => Ok(Filter::new()),
    }
}

fn parse_schema(data: Option<&str>, strict: bool) -> Result<Option<Schema>, Error> {
    data.map(|data| Schema::from_json(&parse_inline_json(data)?, strict))
        .transpose()
}

/// Opens the directory and loads one table for a single command.
fn open_table(table_dir: &Path, name: &str) -> Result<Database, Error> {
    let mut db = Database::open(table_dir)?;
    db.load_table(name).map_err(|err| add_missing_table_hint(err, name))?;
    Ok(db)
}

fn add_missing_table_hint(err: Error, name: &str) -> Error {
    if err.kind() != ErrorKind::TableNotFound || err.hint().is_some() {
        return err;
    }
    err.with_hint(format!(
        "Create it first: tabula table create {name} (or list tables with `tabula table list`)."
    ))
}

fn add_io_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::Permission => err.with_hint(
            "Permission denied. Check directory permissions or use --dir to a writable location.",
        ),
        ErrorKind::Io | ErrorKind::CommitFailed => {
            err.with_hint("I/O error. Check the path, filesystem, and disk space.")
        }
        _ => err,
    }
}

fn add_corrupt_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Corrupt || err.hint().is_some() {
        return err;
    }
    err.with_hint("Table file is not valid tabula JSON. Restore it from a backup.")
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint(
        "Unexpected internal failure. Retry with RUST_BACKTRACE=1 and share command/context if it persists.",
    )
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_text(err: &Error) -> String {
    let value = error_json(err);
    let inner = &value["error"];
    let mut lines = vec![format!(
        "error: {}",
        inner["message"].as_str().unwrap_or("error")
    )];
    for key in ["hint", "table", "path"] {
        if let Some(text) = inner.get(key).and_then(Value::as_str) {
            lines.push(format!("{key}: {text}"));
        }
    }
    if let Some(cause) = inner
        .get("causes")
        .and_then(Value::as_array)
        .and_then(|causes| causes.first())
        .and_then(Value::as_str)
    {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

fn clap_error_hint(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let usage = rendered
        .lines()
        .find_map(|line| line.trim().strip_prefix("Usage: "))
        .map(str::trim);
    let Some(usage) = usage else {
        return "Try `tabula --help`.".to_string();
    };

    let tokens: Vec<&str> = usage.split_whitespace().collect();
    let Some(pos) = tokens.iter().position(|t| *t == "tabula") else {
        return "Try `tabula --help`.".to_string();
    };
    let parts: Vec<&str> = tokens
        .iter()
        .skip(pos + 1)
        .take_while(|token| {
            !(token.starts_with('-') || token.starts_with('<') || token.starts_with('['))
        })
        .copied()
        .collect();
    if parts.is_empty() {
        return "Try `tabula --help`.".to_string();
    }
    format!("Try `tabula {} --help`.", parts.join(" "))
}
