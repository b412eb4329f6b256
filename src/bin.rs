use std::{
    fs::{self, File, Permissions},
    io::{self, Read, Write},
    os::unix::fs::PermissionsExt,
    path::PathBuf,
    time::Instant,
};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use colored::Colorize;

use tapeir::{
    backend::compiler::compile,
    frontend::{
        codegen::{codegen, ENTRY_POINT},
        parser::Program,
    },
    ir::{exec::Executor, passes::optimize, verify::verify_module},
};

/// Brainfuck to IR translator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The source file, or `-` for stdin
    #[arg()]
    file: String,

    /// What to produce
    #[arg(short, long, value_enum, default_value_t = Emit::Ir)]
    emit: Emit,

    /// Where to write the output (stdout if absent)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Reject unmatched brackets instead of closing them implicitly
    #[arg(long)]
    strict: bool,

    /// Optimize the generated IR: forward loads, fold constants and remove
    /// dead stores, dead code and unreachable blocks
    #[arg(long)]
    simplify: bool,

    /// Execute the generated IR on stdin/stdout instead of emitting it
    #[arg(long)]
    run: bool,

    /// Don't print progress to stderr
    #[arg(short, long)]
    quiet: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Emit {
    /// Textual IR
    Ir,
    /// The parsed program, re-printed as source
    Ast,
    /// A static x86-64 Linux executable
    Elf,
}

struct Status {
    quiet: bool,
}

impl Status {
    fn time<T>(&self, what: &str, f: impl FnOnce() -> T) -> T {
        if !self.quiet {
            eprintln!("{}", format!("Starting {what}").blue());
        }

        let now = Instant::now();
        let result = f();

        if !self.quiet {
            eprintln!(
                "{} {:.2?}",
                format!("Finished {what} in").green(),
                now.elapsed()
            );
        }

        result
    }
}

fn read_source(file: &str) -> Result<Vec<u8>> {
    if file == "-" {
        let mut buffer = vec![];
        io::stdin()
            .read_to_end(&mut buffer)
            .context("Reading stdin")?;
        Ok(buffer)
    } else {
        fs::read(file).with_context(|| format!("Reading {file}"))
    }
}

fn write_output(
    path: Option<&PathBuf>,
    bytes: &[u8],
    executable: bool,
) -> Result<()> {
    let Some(path) = path else {
        let mut stdout = io::stdout().lock();
        stdout.write_all(bytes).context("Writing stdout")?;
        return stdout.flush().context("Writing stdout");
    };

    let mut file = File::create(path)
        .with_context(|| format!("Creating {}", path.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("Writing {}", path.display()))?;

    if executable {
        file.set_permissions(Permissions::from_mode(0o755))
            .with_context(|| {
                format!("Marking {} executable", path.display())
            })?;
    }

    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let status = Status { quiet: args.quiet };

    let source = read_source(&args.file)?;

    let program = status.time("parsing", || {
        if args.strict {
            Program::try_parse_strict(&source[..])
        } else {
            Program::try_parse(&source[..])
        }
    });
    let program = program.with_context(|| format!("Parsing {}", args.file))?;

    let mut module = status
        .time("code generation", || codegen(&program))
        .context("Generating IR")?;

    if args.simplify {
        let main = module
            .function_mut(ENTRY_POINT)
            .context("Generated module has no entry point")?;
        let changes = status.time("optimization", || optimize(main));
        verify_module(&module).context("Verifying optimized IR")?;

        if !args.quiet {
            eprintln!("{} {changes}", "Changes made by optimization:".green());
        }
    }

    if args.run {
        let stdin = io::stdin().lock();
        let stdout = io::stdout().lock();
        let mut exec = Executor::new(stdin, stdout);

        return status
            .time("execution", || exec.run(&module, ENTRY_POINT))
            .context("Running program");
    }

    let bytes = match args.emit {
        Emit::Ir => module.to_string().into_bytes(),
        Emit::Elf => status
            .time("native compilation", || compile(&module, ENTRY_POINT))
            .context("Compiling to x86-64")?,
        Emit::Ast => program.to_string().into_bytes(),
    };

    write_output(args.output.as_ref(), &bytes, args.emit == Emit::Elf)
}
