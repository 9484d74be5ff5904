use log::info;
use openclaw_deployer::config::Config;
use openclaw_deployer::context::Context;
use openclaw_deployer::http;
use std::error::Error;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
  env_logger::init();

  let config = Config::from_env()?;
  let listen_addr = config.http_listen_addr;
  info!("starting openclaw-deployer, listening on {}", listen_addr);

  let ctx = Context::build(config).await?;
  let routes = http::routes(ctx);

  let (_, server) = warp::serve(routes).bind_with_graceful_shutdown(listen_addr, async {
    tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    info!("received shutdown signal, draining in-flight requests");
  });
  server.await;

  Ok(())
}
