// =============================================================================
// RHI smoke test - exercises a device end to end without a window
// =============================================================================
//
// FLOW:
// 1. Load config.toml, pick the backend
// 2. Upload a pattern through the staging manager
// 3. Copy it GPU-side into a readback buffer, bracketed by timestamps
// 4. Read it back, check it, report timings
//
// =============================================================================

use anyhow::{Context, Result};
use std::fs::File;
use std::time::{Duration, Instant};

use my_rhi::{
    Backend, BackendKind, BufferDesc, BufferUsage, CommandPool, Config, Device, Fence,
    HeadlessDevice, MemoryResidency, QueryPool, QueueType, StagingManager, VulkanDevice,
    WaitStatus,
};

const PATTERN_SIZE: usize = 1024 * 1024;

fn main() -> Result<()> {
    let config = Config::load();
    init_logging(&config)?;

    log::info!("Starting RHI smoke test on the {:?} backend", config.backend.kind);
    match config.backend.kind {
        BackendKind::Vulkan => run::<VulkanDevice>(&config),
        BackendKind::Headless => run::<HeadlessDevice>(&config),
    }
}

/// Initialize logging, optionally into a file instead of stderr
fn init_logging(config: &Config) -> Result<()> {
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(config.log_level());

    if config.debug.log_to_file {
        let file = File::create(&config.debug.log_file)
            .with_context(|| format!("Failed to create log file {}", config.debug.log_file))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

fn run<B: Backend>(config: &Config) -> Result<()> {
    let device = Device::<B>::new(config)?;
    let calibration = device.calibrate_clocks()?;
    log::info!(
        "Clock calibration: cpu {} ns <-> gpu {} ticks ({} ns/tick)",
        calibration.cpu_ns,
        calibration.gpu_ticks,
        device.timestamp_period()
    );

    let pattern: Vec<u8> = (0..PATTERN_SIZE).map(|i| (i % 251) as u8).collect();

    // Device-local destination, filled through staging
    let gpu_buffer = device.create_buffer(&BufferDesc {
        name: "smoke_gpu",
        size: PATTERN_SIZE as u64,
        usage: BufferUsage::STORAGE_BUFFER | BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
        residency: MemoryResidency::GpuOnly,
    })?;
    let readback = device.create_buffer(&BufferDesc {
        name: "smoke_readback",
        size: PATTERN_SIZE as u64,
        usage: BufferUsage::TRANSFER_DST,
        residency: MemoryResidency::GpuToCpu,
    })?;

    let upload_start = Instant::now();
    let mut staging = StagingManager::new(&device, &config.staging)?;
    staging.upload_buffer(&gpu_buffer, 0, &pattern)?;
    staging.submit_all_pending_upload()?;
    log::info!("Upload of {} bytes took {:?}", PATTERN_SIZE, upload_start.elapsed());

    let queries = QueryPool::new(&device, "smoke_timestamps", 2)?;
    let mut commands = CommandPool::new(&device, "smoke");
    let fence = Fence::new(&device, "smoke_fence")?;
    {
        let cmd = commands.get_command_buffer(QueueType::Graphics)?;
        cmd.begin()?;
        cmd.reset_query_pool(&queries);
        cmd.write_timestamp(&queries, 0);
        cmd.buffer_barrier(&gpu_buffer);
        cmd.copy_buffer(&gpu_buffer, 0, &readback, 0, PATTERN_SIZE as u64);
        cmd.write_timestamp(&queries, 1);
        cmd.end()?;
        cmd.submit(Some(&fence), None, None)?;
    }
    if fence.wait(Duration::from_secs(5))? == WaitStatus::TimedOut {
        anyhow::bail!("GPU copy did not finish within 5 seconds");
    }

    let bytes = readback.read_to_vec()?;
    anyhow::ensure!(bytes == pattern, "readback does not match the uploaded pattern");

    let ticks = queries.results(0, 2)?;
    let gpu_ns = ticks[1].saturating_sub(ticks[0]) as f64 * device.timestamp_period() as f64;
    log::info!("GPU copy of {} bytes: {:.3} us", PATTERN_SIZE, gpu_ns / 1000.0);

    commands.reset()?;
    device.wait_idle()?;
    log::info!("Smoke test passed");
    Ok(())
}
