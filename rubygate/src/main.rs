use clap::Parser as ClapParser;
use std::{path::PathBuf, process};

use rubygate::{DefaultApi, Error, VM, VMCreateInfo};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Ruby script to load
    script: PathBuf,

    /// Extra load path entries
    #[arg(short = 'I', value_name = "DIR", help = "Add DIR to $LOAD_PATH")]
    include: Vec<PathBuf>,

    #[arg(long, help = "Load the script under an anonymous module")]
    wrap: bool,

    #[arg(long, help = "Start the interpreter without RubyGems")]
    disable_gems: bool,

    /// Constants to print after loading, `A::B` paths allowed
    #[arg(short = 'c', long = "constant", value_name = "CONST")]
    constants: Vec<String>,

    #[arg(short, long, action = clap::ArgAction::Count, help = "More logging, repeatable")]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn run(vm: &VM<DefaultApi>, cli: &Cli) -> Result<(), Error> {
    vm.setup_with(&VMCreateInfo {
        load_paths: cli.include.clone(),
        disable_gems: cli.disable_gems,
        ..Default::default()
    })?;
    vm.load(&cli.script, cli.wrap)?;
    for name in &cli.constants {
        let value = vm.get_constant(name)?;
        println!("{name} = {}", vm.inspect(value)?);
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let vm = VM::shared();
    let failed = run(vm, &cli).is_err();
    if failed {
        for error in vm.history().errors() {
            eprintln!("error: {error}");
        }
    }

    let code = vm.cleanup();
    process::exit(if failed { 1 } else { code });
}
