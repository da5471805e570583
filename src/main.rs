use std::process::ExitCode;

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match sockmap_agent::Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::FAILURE;
        }
    };

    simple_logger::init_with_level(config.log.level.as_level()).expect("logger already initialized");

    // The kernel pins the map's pages and refuses to let userspace open a
    // HashMap-backed map under a locked-memory rlimit; raise it the same
    // way the datapath loader itself would before it ever touches bpffs.
    if let Err(err) = rlimit::Resource::MEMLOCK.set(rlimit::INFINITY, rlimit::INFINITY) {
        log::warn!("failed to raise memlock rlimit: {err} (map open may fail)");
    }

    if let Err(err) = sockmap_agent::startup(config).await {
        log::error!("fatal: {err}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
