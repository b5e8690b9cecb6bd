//! Nest VM runner
//!
//! Runs a bytecode listing, or starts an interactive shell where every line
//! is one instruction body of a `main` function.

use std::process::ExitCode;

use nestvm::asm::{self, AsmError};
use nestvm::{Config, Context};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: nestvm [--dump] [-O LEVEL] [--no-default] [FILE.nsa [ARGS...]]";

struct Options {
    dump: bool,
    opt_level: u8,
    no_default: bool,
    file: Option<String>,
    argv: Vec<String>,
}

fn parse_args() -> Result<Options, String> {
    let mut opts = Options {
        dump: false,
        opt_level: nestvm::config::DEFAULT_OPT_LEVEL,
        no_default: false,
        file: None,
        argv: Vec::new(),
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--dump" => opts.dump = true,
            "--no-default" => opts.no_default = true,
            "-O" => {
                let level = args.next().ok_or("-O needs a level")?;
                opts.opt_level = level
                    .parse()
                    .map_err(|_| format!("invalid optimisation level '{}'", level))?;
            }
            "-h" | "--help" => return Err(USAGE.to_owned()),
            _ => {
                opts.argv.push(arg.clone());
                opts.file = Some(arg);
                opts.argv.extend(args.by_ref());
            }
        }
    }
    Ok(opts)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("NESTVM_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let opts = match parse_args() {
        Ok(opts) => opts,
        Err(msg) => {
            eprintln!("{}", msg);
            return ExitCode::from(2);
        }
    };

    let cwd = opts
        .file
        .as_deref()
        .and_then(|f| std::path::Path::new(f).parent())
        .map(|p| p.to_path_buf())
        .filter(|p| !p.as_os_str().is_empty())
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_default();
    let config = Config::default()
        .with_opt_level(opts.opt_level)
        .with_no_default(opts.no_default)
        .with_argv(opts.argv.clone())
        .with_cwd(cwd)
        .with_color(std::env::var_os("NO_COLOR").is_none());

    let mut ctx = match Context::new(config) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    match opts.file.as_deref() {
        Some(file) => run_file(&mut ctx, file, opts.dump),
        None => run_repl(&mut ctx, opts.dump),
    }
}

fn run_file(ctx: &mut Context, filename: &str, dump: bool) -> ExitCode {
    let source = match std::fs::read_to_string(filename) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error reading {}: {}", filename, e);
            return ExitCode::FAILURE;
        }
    };

    if dump {
        return dump_listing(ctx, &source, filename);
    }

    let main = match asm::assemble(ctx, &source, filename) {
        Ok(main) => main,
        Err(e) => {
            eprintln!("{}: {}", filename, e);
            return ExitCode::FAILURE;
        }
    };
    let result = ctx.run_program(main);
    ctx.heap_mut().dec_ref(main);
    match result {
        Ok(value) => {
            ctx.heap_mut().dec_ref(value);
            ExitCode::SUCCESS
        }
        Err(_) => {
            eprint!("{}", ctx.render_traceback());
            ExitCode::FAILURE
        }
    }
}

fn dump_listing(ctx: &mut Context, source: &str, filename: &str) -> ExitCode {
    let funcs = match asm::assemble_all(ctx, source, filename) {
        Ok(funcs) => funcs,
        Err(e) => {
            eprintln!("{}: {}", filename, e);
            return ExitCode::FAILURE;
        }
    };
    let mut code = ExitCode::SUCCESS;
    for (_, func) in &funcs {
        match asm::disassemble(ctx.heap(), *func) {
            Ok(listing) => println!("{}", listing),
            Err(e) => {
                eprintln!("{}", e);
                code = ExitCode::FAILURE;
            }
        }
    }
    for (_, func) in funcs {
        ctx.heap_mut().dec_ref(func);
    }
    code
}

fn eval_line(ctx: &mut Context, line: &str, dump: bool) -> Result<Option<String>, AsmError> {
    let src = format!("func {}()\n{}\nend\n", asm::MAIN_NAME, line);
    let main = asm::assemble(ctx, &src, "<stdin>")?;
    if dump {
        if let Ok(listing) = asm::disassemble(ctx.heap(), main) {
            print!("{}", listing);
        }
    }
    let result = ctx.run_program(main);
    ctx.heap_mut().dec_ref(main);
    let value = result?;
    let shown = (!ctx.heap().is_null(value)).then(|| ctx.heap().display(value));
    ctx.heap_mut().dec_ref(value);
    Ok(shown)
}

fn run_repl(ctx: &mut Context, dump: bool) -> ExitCode {
    println!("Nest VM {}", env!("CARGO_PKG_VERSION"));
    println!("Enter instructions separated by ';;'; RETURN_VAL prints the top value. Ctrl+D to exit.\n");

    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("Error starting the shell: {}", e);
            return ExitCode::FAILURE;
        }
    };

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line);

                let body = line.split(";;").collect::<Vec<_>>().join("\n");
                match eval_line(ctx, &body, dump) {
                    Ok(Some(shown)) => println!("{}", shown),
                    Ok(None) => {}
                    Err(AsmError::Runtime(_)) => print!("{}", ctx.render_traceback()),
                    Err(e) => println!("{}", e),
                }
                ctx.collect();
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => {
                println!();
                break;
            }
            Err(e) => {
                eprintln!("Error reading input: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::SUCCESS
}
