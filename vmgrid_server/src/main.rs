use anyhow::Context;

use vmgrid_settings::Settings;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let settings = Settings::load().context("loading settings")?;

    // The request workers, background loops and provider calls all run on
    // this bounded runtime.
    let worker_threads = settings.server.thread_pool_max.clamp(2, 512);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
        .context("building runtime")?;

    runtime.block_on(vmgrid_server::serve(settings))
}
