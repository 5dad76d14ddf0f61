//! Purpose: `framelog` CLI entry point for inspecting and editing segment files.
//! Role: Binary crate root; parses args, installs tracing, runs commands, emits JSON on stdout.
//! Invariants: Every command emits exactly one JSON document on stdout (pretty on a terminal).
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
use std::io::{self, IsTerminal, Read, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

mod command_dispatch;

use framelog::api::{
    DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_INDEX_BYTES, Error, ErrorKind, to_exit_code,
};

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
    init_tracing();
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
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
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(clap_error_summary(&err))
                        .with_hint("Try `framelog --help`."),
                    ColorMode::Auto,
                ));
            }
        },
    };

    let color_mode = cli.color;
    command_dispatch::dispatch_command(cli.command)
        .map_err(add_io_hint)
        .map_err(|err| (err, color_mode))
}

#[derive(Parser)]
#[command(
    name = "framelog",
    version,
    about = "Inspect and edit commit-log segment files (frame store + offset index)",
    long_about = None,
    after_help = r#"EXAMPLES
  $ framelog store append 0.store 'Hello World'
  $ framelog store read 0.store 0
  $ framelog index write 0.index 0 0
  $ framelog index read 0.index -1
  $ framelog validate 0.store 0.index

NOTES
  - Store frames are [u64 BE length][payload]; index entries are [u32 BE offset][u64 BE position]
  - RUST_LOG=debug shows open/close events on stderr"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(arg_required_else_help = true, about = "Append to and read from a frame store")]
    Store {
        #[arg(
            long,
            global = true,
            default_value_t = DEFAULT_BUFFER_CAPACITY,
            help = "Write buffer size in bytes"
        )]
        buffer_bytes: usize,
        #[command(subcommand)]
        command: StoreCommand,
    },
    #[command(arg_required_else_help = true, about = "Write and read offset index entries")]
    Index {
        #[arg(
            long,
            global = true,
            default_value_t = DEFAULT_MAX_INDEX_BYTES,
            help = "Mapped index capacity in bytes"
        )]
        max_index_bytes: u64,
        #[command(subcommand)]
        command: IndexCommand,
    },
    #[command(
        arg_required_else_help = true,
        about = "Check a store and its index for torn frames and dangling entries",
        after_help = r#"EXAMPLES
  $ framelog validate 0.store 0.index

NOTES
  - Files are read only; nothing is repaired
  - Exit code 7 when issues are found"#
    )]
    Validate {
        #[arg(help = "Store file", value_hint = ValueHint::FilePath)]
        store: PathBuf,
        #[arg(help = "Index file", value_hint = ValueHint::FilePath)]
        index: PathBuf,
    },
    #[command(about = "Generate shell completions")]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
    #[command(about = "Print version info")]
    Version,
}

#[derive(Subcommand)]
enum StoreCommand {
    #[command(about = "Append one payload and report its position")]
    Append {
        #[arg(help = "Store file", value_hint = ValueHint::FilePath)]
        store: PathBuf,
        #[arg(help = "Inline payload")]
        data: Option<String>,
        #[arg(
            short = 'f',
            long = "file",
            help = "Read the payload from a file (use - for stdin)",
            conflicts_with = "data",
            value_hint = ValueHint::FilePath
        )]
        file: Option<String>,
    },
    #[command(about = "Read the frame at a byte position")]
    Read {
        #[arg(help = "Store file", value_hint = ValueHint::FilePath)]
        store: PathBuf,
        #[arg(help = "Byte position of the frame")]
        position: u64,
        #[arg(long, help = "Write the raw payload to stdout instead of JSON")]
        raw: bool,
    },
    #[command(about = "List every frame in the store")]
    Dump {
        #[arg(help = "Store file", value_hint = ValueHint::FilePath)]
        store: PathBuf,
    },
}

#[derive(Subcommand)]
enum IndexCommand {
    #[command(about = "Append an entry mapping a relative offset to a store position")]
    Write {
        #[arg(help = "Index file", value_hint = ValueHint::FilePath)]
        index: PathBuf,
        #[arg(help = "Relative offset")]
        offset: u32,
        #[arg(help = "Store position")]
        position: u64,
    },
    #[command(about = "Read one entry (-1 for the newest)")]
    Read {
        #[arg(help = "Index file", value_hint = ValueHint::FilePath)]
        index: PathBuf,
        #[arg(help = "Entry number, or -1", allow_negative_numbers = true)]
        entry: i64,
    },
    #[command(about = "List every entry in the index")]
    Dump {
        #[arg(help = "Index file", value_hint = ValueHint::FilePath)]
        index: PathBuf,
    },
}

fn read_payload(data: Option<String>, file: Option<String>) -> Result<Vec<u8>, Error> {
    match (data, file) {
        (Some(data), None) => Ok(data.into_bytes()),
        (None, Some(file)) if file == "-" => {
            let mut buf = Vec::new();
            io::stdin()
                .lock()
                .read_to_end(&mut buf)
                .map_err(|err| Error::new(ErrorKind::Io).with_message("failed to read stdin").with_source(err))?;
            Ok(buf)
        }
        (None, Some(file)) => std::fs::read(&file).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read payload file")
                .with_path(&file)
                .with_source(err)
        }),
        _ => Err(Error::new(ErrorKind::Usage)
            .with_message("missing payload")
            .with_hint("Pass inline DATA or -f FILE.")),
    }
}

fn frame_json(position: u64, payload: &[u8]) -> Value {
    let text = std::str::from_utf8(payload);
    json!({
        "position": position,
        "len": payload.len(),
        "utf8": text.is_ok(),
        "data": String::from_utf8_lossy(payload),
    })
}

fn write_raw(payload: &[u8]) -> Result<(), Error> {
    let mut stdout = io::stdout().lock();
    stdout
        .write_all(payload)
        .and_then(|()| stdout.flush())
        .map_err(|err| Error::new(ErrorKind::Io).with_message("failed to write stdout").with_source(err))
}

fn emit_version_output() {
    if io::stdout().is_terminal() {
        println!("framelog {}", env!("CARGO_PKG_VERSION"));
    } else {
        emit_json(json!({
            "name": "framelog",
            "version": env!("CARGO_PKG_VERSION"),
        }));
    }
}

fn emit_json(value: Value) {
    let json = (if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    })
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

const RED: &str = "31";
const YELLOW: &str = "33";

fn colorize_label(label: &str, enabled: bool, code: &str) -> String {
    if enabled {
        format!("\u{1b}[{code}m{label}\u{1b}[0m")
    } else {
        label.to_string()
    }
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn add_io_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::Permission => {
            err.with_hint("Permission denied. Check file permissions or pick a writable path.")
        }
        ErrorKind::Io => err.with_hint("I/O error. Check the path, filesystem, and disk space."),
        ErrorKind::NotFound => err.with_hint("Use `framelog index dump` to list written entries."),
        _ => err,
    }
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::Capacity => "capacity exceeded".to_string(),
        ErrorKind::Busy => "resource is busy".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Corrupt => "corrupt data".to_string(),
        ErrorKind::Closed => "already closed".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(entry) = err.entry() {
        inner.insert("entry".to_string(), json!(entry));
    }
    if let Some(position) = err.position() {
        inner.insert("position".to_string(), json!(position));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = vec![format!(
        "{} {}",
        colorize_label("error:", use_color, RED),
        error_message(err)
    )];
    let details = [
        ("hint:", err.hint().map(str::to_string)),
        ("path:", err.path().map(|path| path.display().to_string())),
        ("entry:", err.entry().map(|entry| entry.to_string())),
        ("position:", err.position().map(|position| position.to_string())),
        ("caused by:", error_causes(err).into_iter().next()),
    ];
    for (label, value) in details {
        if let Some(value) = value {
            lines.push(format!("{} {value}", colorize_label(label, use_color, YELLOW)));
        }
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    err.to_string()
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.strip_prefix("error:").unwrap_or(line).trim().to_string())
        .unwrap_or_else(|| "invalid arguments".to_string())
}

#[cfg(test)]
mod tests {
    use super::{Cli, error_json, error_text, frame_json, read_payload};
    use clap::CommandFactory;
    use framelog::api::{Error, ErrorKind};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn error_text_respects_color_flag() {
        let err = Error::new(ErrorKind::NotFound)
            .with_message("index is empty")
            .with_hint("write first")
            .with_path("/data/0.index")
            .with_entry(-1);
        let plain = error_text(&err, false);
        assert!(plain.starts_with("error: index is empty"));
        assert!(plain.contains("hint: write first"));
        assert!(plain.contains("path: /data/0.index"));
        assert!(plain.contains("entry: -1"));
        assert!(!plain.contains("position:"));
        assert!(!plain.contains('\u{1b}'));

        let colored = error_text(&err, true);
        assert!(colored.contains("\u{1b}[31merror:\u{1b}[0m"));
    }

    #[test]
    fn error_json_carries_context() {
        let err = Error::new(ErrorKind::Capacity)
            .with_message("index is full at 3 entries")
            .with_entry(3)
            .with_source(std::io::Error::other("disk"));
        let value = error_json(&err);
        assert_eq!(value["error"]["kind"], "Capacity");
        assert_eq!(value["error"]["entry"], 3);
        assert_eq!(value["error"]["causes"][0], "disk");
    }

    #[test]
    fn frame_json_flags_binary_payloads() {
        let value = frame_json(19, b"Hello World");
        assert_eq!(value["position"], 19);
        assert_eq!(value["len"], 11);
        assert_eq!(value["utf8"], true);
        assert_eq!(value["data"], "Hello World");

        let value = frame_json(0, &[0xff, 0xfe]);
        assert_eq!(value["utf8"], false);
    }

    #[test]
    fn payload_requires_data_or_file() {
        assert_eq!(
            read_payload(Some("abc".to_string()), None).expect("inline"),
            b"abc"
        );
        let err = read_payload(None, None).expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
