use clap::Parser;

fn main() {
    let cli = loopcastctl::Cli::parse();
    loopcastctl::init_tracing(cli.verbose);
    if let Err(err) = loopcastctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
