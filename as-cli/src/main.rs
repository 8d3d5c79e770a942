use std::path::PathBuf;
use std::process::ExitCode;

use as_lib::assemble_file;

use clap::Parser;

/// 16-bit two-pass assembler
#[derive(Parser)]
#[command(about)]
struct Args {
    /// Input assembly file (.s)
    input: PathBuf,

    /// Object file to write (.o); a .txt listing lands next to it
    #[arg(long, short, required = true)]
    output: PathBuf,
}

fn main() -> ExitCode {
    env_logger::init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = assemble_file(&args.input, &args.output) {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }

    println!("Assembling finished successfully!");
    ExitCode::SUCCESS
}
