//! Builds a minidump from PE images and raw memory blobs.
//!
//! Arguments are processed in command-line order, so `-a` applies to the
//! blobs that follow it, and `-o` has to come before any image or blob.

use {
    anyhow::{Context, Result, bail},
    clap::{ArgMatches, CommandFactory, FromArgMatches, Parser},
    minidump_builder::{
        MinidumpBuilder, MinidumpReader,
        builder::{DEFAULT_STACK_ADDRESS, DEFAULT_STACK_SIZE},
    },
    std::path::{Path, PathBuf},
};

/// Assembles a minidump out of PE images, raw blobs and a synthetic stack.
///
/// Option values may be attached with a colon, as in `-a:0x10000`. Numbers
/// are hexadecimal with a `0x` prefix, octal with a leading `0`, and decimal
/// otherwise.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address of the next blob
    #[arg(short = 'a', value_name = "ADDRESS")]
    address: Vec<String>,

    /// Add a blob at the current address, then advance the address past it
    #[arg(short = 'b', value_name = "FILE")]
    blob: Vec<String>,

    /// Size of the stack region
    #[arg(short = 'c', value_name = "SIZE")]
    stack_size: Vec<String>,

    /// Address of the stack region
    #[arg(short = 's', value_name = "ADDRESS")]
    stack_address: Vec<String>,

    /// Print an existing dump
    #[arg(short = 'd', value_name = "FILE")]
    dump: Vec<String>,

    /// Output file, must come before any image or blob
    #[arg(short = 'o', value_name = "FILE")]
    output: Vec<String>,

    /// Log every region as it is written, and report problems in the inputs
    #[arg(short = 'v')]
    verbose: bool,

    /// PE images to embed. The first one is the primary image.
    modules: Vec<PathBuf>,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Address(String),
    Blob(PathBuf),
    StackSize(String),
    StackAddress(String),
    Dump(PathBuf),
    Output(PathBuf),
    Module(PathBuf),
}

fn strip_colon(value: String) -> String {
    match value.strip_prefix(':') {
        Some(stripped) => stripped.to_owned(),
        None => value,
    }
}

/// Interleaves the values of every option back into command-line order
fn commands(matches: &ArgMatches, args: Args) -> Vec<Command> {
    fn indexed<T>(
        matches: &ArgMatches,
        id: &str,
        values: Vec<T>,
        make: impl Fn(T) -> Command,
    ) -> Vec<(usize, Command)> {
        matches
            .indices_of(id)
            .into_iter()
            .flatten()
            .zip(values)
            .map(|(index, value)| (index, make(value)))
            .collect()
    }

    let path = |value: String| PathBuf::from(strip_colon(value));
    let mut commands = Vec::new();
    commands.extend(indexed(matches, "address", args.address, |v| {
        Command::Address(strip_colon(v))
    }));
    commands.extend(indexed(matches, "blob", args.blob, |v| Command::Blob(path(v))));
    commands.extend(indexed(matches, "stack_size", args.stack_size, |v| {
        Command::StackSize(strip_colon(v))
    }));
    commands.extend(indexed(matches, "stack_address", args.stack_address, |v| {
        Command::StackAddress(strip_colon(v))
    }));
    commands.extend(indexed(matches, "dump", args.dump, |v| Command::Dump(path(v))));
    commands.extend(indexed(matches, "output", args.output, |v| {
        Command::Output(path(v))
    }));
    commands.extend(indexed(matches, "modules", args.modules, Command::Module));

    commands.sort_by_key(|(index, _)| *index);
    commands.into_iter().map(|(_, command)| command).collect()
}

/// Parses a number the way C parses integer literals
fn parse_c_number(value: &str) -> Result<u64> {
    let value = value.trim();
    let (digits, radix) = if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        (hex, 16)
    } else if value.len() > 1 && value.starts_with('0') {
        (&value[1..], 8)
    } else {
        (value, 10)
    };
    u64::from_str_radix(digits, radix).with_context(|| format!("invalid number {value:?}"))
}

fn print_dump(path: &Path) -> Result<()> {
    let reader = MinidumpReader::open(path)?;
    reader.print(&mut std::io::stdout().lock())?;
    Ok(())
}

fn main() -> Result<()> {
    let matches = Args::command().get_matches();
    let args = Args::from_arg_matches(&matches)?;

    let level = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .format_target(false)
        .init();
    let verbose = args.verbose;

    let mut builder: Option<MinidumpBuilder> = None;
    let mut address = 0u64;
    let mut stack_address = DEFAULT_STACK_ADDRESS;
    let mut stack_size = DEFAULT_STACK_SIZE;

    for command in commands(&matches, args) {
        match command {
            Command::Address(value) => address = parse_c_number(&value)?,
            Command::StackSize(value) => stack_size = parse_c_number(&value)?,
            Command::StackAddress(value) => stack_address = parse_c_number(&value)?,
            Command::Dump(path) => {
                if let Err(e) = print_dump(&path) {
                    eprintln!("{}: {e:#}", path.display());
                }
            }
            Command::Output(path) => {
                if builder.is_some() {
                    bail!("only one output file can be given");
                }
                builder = Some(MinidumpBuilder::create(path)?);
            }
            Command::Blob(path) => {
                let builder = builder
                    .as_mut()
                    .context("-o must be given before any blob")?;
                let size = builder.add_blob(&path, address)?;
                address = address.wrapping_add(size);
            }
            Command::Module(path) => {
                builder
                    .as_mut()
                    .context("-o must be given before any image")?
                    .add_module(&path)?;
            }
        }
    }

    let Some(mut builder) = builder else {
        return Ok(());
    };
    builder.set_stack(stack_address, stack_size);

    if verbose && !builder.soft_errors().is_empty() {
        eprintln!("Soft errors:");
        eprintln!("{}", serde_json::to_string_pretty(builder.soft_errors())?);
    }

    let path = builder.path().to_owned();
    let summary = builder.write()?;
    log::info!(
        "{}: {} modules, {} regions, {:#x} bytes",
        path.display(),
        summary.module_count,
        summary.regions.len(),
        summary.file_size
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(argv: &[&str]) -> Vec<Command> {
        let matches = Args::command().try_get_matches_from(argv).unwrap();
        let args = Args::from_arg_matches(&matches).unwrap();
        commands(&matches, args)
    }

    #[test]
    fn c_numbers() {
        assert_eq!(parse_c_number("0x2fff00").unwrap(), 0x2fff00);
        assert_eq!(parse_c_number("0X10").unwrap(), 0x10);
        assert_eq!(parse_c_number("0100").unwrap(), 0o100);
        assert_eq!(parse_c_number("0").unwrap(), 0);
        assert_eq!(parse_c_number("4096").unwrap(), 4096);
        assert!(parse_c_number("09").is_err());
        assert!(parse_c_number("0xzz").is_err());
        assert!(parse_c_number("").is_err());
    }

    #[test]
    fn commands_keep_command_line_order() {
        let commands = parse(&[
            "mkdump",
            "-o:out.dmp",
            "-a:0x1000",
            "-b:one.bin",
            "kernel.exe",
            "-a",
            "0x2000",
            "-b:two.bin",
            "-s:0x100000",
            "-c:0x400",
            "-d:old.dmp",
            "driver.sys",
        ]);
        assert_eq!(
            commands,
            vec![
                Command::Output("out.dmp".into()),
                Command::Address("0x1000".into()),
                Command::Blob("one.bin".into()),
                Command::Module("kernel.exe".into()),
                Command::Address("0x2000".into()),
                Command::Blob("two.bin".into()),
                Command::StackAddress("0x100000".into()),
                Command::StackSize("0x400".into()),
                Command::Dump("old.dmp".into()),
                Command::Module("driver.sys".into()),
            ]
        );
    }

    #[test]
    fn verbose_is_not_a_command() {
        let commands = parse(&["mkdump", "-v", "-o:x.dmp"]);
        assert_eq!(commands, vec![Command::Output("x.dmp".into())]);
    }
}
