#[tokio::main]
async fn main() -> anyhow::Result<()> {
    vox_server::run().await
}
