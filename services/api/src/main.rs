#[tokio::main]
async fn main() {
    if let Err(err) = agenda_api::run().await {
        eprintln!("agenda: {err}");
        std::process::exit(1);
    }
}
