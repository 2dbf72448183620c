#[tokio::main]
async fn main() -> eyre::Result<()> {
    sqloj::run().start().await
}
