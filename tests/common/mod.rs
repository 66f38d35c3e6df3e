// Shared setup for the headless integration tests
#![allow(dead_code)]

use my_rhi::{
    Buffer, BufferDesc, BufferUsage, Config, Device, HeadlessDevice, MemoryResidency, QueueType,
};

pub type TestDevice = Device<HeadlessDevice>;

/// Small staging blocks keep the pools cheap to fill up
pub const BLOCK_SIZE: u64 = 4096;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn config() -> Config {
    let mut config = Config::headless();
    config.staging.staging_block_size = BLOCK_SIZE;
    config
}

pub fn device() -> TestDevice {
    init_logging();
    Device::new(&config()).expect("headless device")
}

pub fn readback_buffer(device: &TestDevice, name: &str, size: u64) -> Buffer<HeadlessDevice> {
    device
        .create_buffer(&BufferDesc {
            name,
            size,
            usage: BufferUsage::TRANSFER_DST,
            residency: MemoryResidency::GpuToCpu,
        })
        .expect("readback buffer")
}

/// Copy a buffer the host cannot map into a readback buffer and return its bytes
pub fn read_gpu_buffer(device: &TestDevice, buffer: &Buffer<HeadlessDevice>) -> Vec<u8> {
    let readback = readback_buffer(device, "readback", buffer.size());
    device
        .one_time_command_submit(QueueType::Graphics, |cmd| {
            cmd.copy_buffer(buffer, 0, &readback, 0, buffer.size());
        })
        .expect("readback submit");
    readback.read_to_vec().expect("readback map")
}
