//! brio - command-line driver
//!
//! Usage:
//!   brio script.brio [args...]   # run a script, args bound to `args`
//!   brio -e 'code'               # evaluate a string and print it
//!   brio                         # interactive REPL
//!
//! `BRIO_LOG` controls diagnostics (e.g. `BRIO_LOG=brio_runtime=trace`
//! to watch GC sweeps and module imports).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use rustyline::error::ReadlineError;
use tracing_subscriber::EnvFilter;

use brio_runtime::{Config, Context, Value};

#[derive(Parser)]
#[command(name = "brio")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "The Brio programming language", long_about = None)]
struct Cli {
    /// Evaluate a code string and print the result
    #[arg(short = 'e', long = "eval", value_name = "CODE")]
    eval: Option<String>,

    /// Reserved for package management
    #[arg(short = 'p', long = "pkg", value_name = "PKG", hide = true)]
    pkg: Option<String>,

    /// Script file to run (starts the REPL when omitted)
    #[arg(value_name = "SCRIPT")]
    script: Option<PathBuf>,

    /// Arguments exposed to the script as the global `args` array
    #[arg(value_name = "ARGS", trailing_var_arg = true)]
    args: Vec<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("BRIO_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if cli.pkg.is_some() {
        eprintln!("brio: package support is reserved and not available yet");
    }

    if let Some(code) = &cli.eval {
        // With -e, a positional "script" is just another argument.
        let mut forwarded = Vec::new();
        if let Some(script) = &cli.script {
            forwarded.push(script.display().to_string());
        }
        forwarded.extend(cli.args.iter().cloned());
        return eval_string(code, &forwarded);
    }
    if let Some(script) = &cli.script {
        return run_script(script, &cli.args);
    }
    repl()
}

fn bind_args(ctx: &mut Context, args: &[String]) {
    let values: Vec<Value> = args.iter().map(|a| ctx.make_string(a)).collect();
    let array = ctx.make_array(&values);
    ctx.set_global_constant("args", array);
}

fn print_errors(ctx: &Context) {
    for error in ctx.errors() {
        eprint!("{}", Context::serialize_error(error));
    }
}

fn eval_string(code: &str, args: &[String]) -> ExitCode {
    let mut ctx = Context::new(Config::new().with_repl_mode(true));
    bind_args(&mut ctx, args);
    let value = ctx.execute(code);
    if ctx.has_errors() {
        print_errors(&ctx);
        return ExitCode::FAILURE;
    }
    println!("{}", ctx.stringify(value));
    ExitCode::SUCCESS
}

fn run_script(script: &PathBuf, args: &[String]) -> ExitCode {
    let mut ctx = Context::new(Config::new());
    bind_args(&mut ctx, args);
    let Some(path) = script.to_str() else {
        eprintln!("brio: script path is not valid UTF-8");
        return ExitCode::FAILURE;
    };
    ctx.execute_file(path);
    if ctx.has_errors() {
        print_errors(&ctx);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn repl() -> ExitCode {
    let mut editor = match rustyline::DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("brio: cannot start interactive mode: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let history_path = std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".brio_history"));
    if let Some(path) = &history_path {
        let _ = editor.load_history(path);
    }

    let mut ctx = Context::new(Config::new().with_repl_mode(true));
    bind_args(&mut ctx, &[]);
    println!("brio {} (ctrl-d to exit)", env!("CARGO_PKG_VERSION"));

    loop {
        match editor.readline("brio> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line.as_str());
                let value = ctx.execute(&line);
                if ctx.has_errors() {
                    print_errors(&ctx);
                } else {
                    println!("{}", ctx.stringify(value));
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("brio: {}", e);
                break;
            }
        }
    }

    if let Some(path) = &history_path {
        let _ = editor.save_history(path);
    }
    ExitCode::SUCCESS
}
