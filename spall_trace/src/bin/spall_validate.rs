//! Check that a Spall trace parses and that every thread's intervals balance.

use clap::Parser;
use spall_trace::SpallFile;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "spall_validate")]
#[command(about = "Check that a Spall trace parses and its intervals balance")]
#[command(version)]
struct Args {
    /// Spall trace to check
    file: PathBuf,

    /// Fail when any thread has unbalanced Begin/End events
    #[arg(long)]
    strict: bool,
}

fn run(args: &Args) -> Result<bool, Box<dyn std::error::Error>> {
    let path = args.file.display();
    let file = File::open(&args.file)
        .map_err(|e| format!("Error opening '{}': {}", path, e))?;
    let spall = SpallFile::parse(BufReader::new(file))
        .map_err(|e| format!("Invalid Spall file '{}': {}", path, e))?;

    let unbalanced = spall.unbalanced_threads();
    println!("Valid Spall file: {}", path);
    println!("  Timestamp unit: {} us", spall.unit.micros());
    println!("  Begin events: {}", spall.begin_count());
    println!("  End events: {}", spall.end_count());
    println!("  Threads: {}", spall.threads().len());
    if !unbalanced.is_empty() {
        println!("  Unbalanced threads:");
        for (pid, tid) in &unbalanced {
            println!("    pid {} tid {}", pid, tid);
        }
    }
    Ok(unbalanced.is_empty() || !args.strict)
}

fn main() -> ExitCode {
    let args = Args::parse();

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
