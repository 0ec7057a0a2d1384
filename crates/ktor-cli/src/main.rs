mod cli;

#[tokio::main]
async fn main() {
    if let Err(err) = cli::run().await {
        eprintln!("ktor error: {:#}", err);
        std::process::exit(1);
    }
}
