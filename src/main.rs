#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    docmerge_server::run().await
}
