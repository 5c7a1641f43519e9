#[tokio::main]
async fn main() -> anyhow::Result<()> {
    gemini_bridge::run().await
}
