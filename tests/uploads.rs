mod common;

use my_rhi::{
    BufferDesc, BufferUsage, Extent3d, Format, MemoryResidency, QueueType, ResourceState,
    StagingManager, TextureDesc, TextureUsage,
};

use common::{device, read_gpu_buffer, readback_buffer, BLOCK_SIZE};

#[test]
fn buffer_upload_reaches_device_local_memory() {
    let device = device();
    let config = common::config();
    let dst = device
        .create_buffer(&BufferDesc {
            name: "upload_dst",
            size: 1024,
            usage: BufferUsage::TRANSFER_DST | BufferUsage::TRANSFER_SRC,
            residency: MemoryResidency::GpuOnly,
        })
        .unwrap();

    let mut staging = StagingManager::new(&device, &config.staging).unwrap();
    staging.upload_buffer(&dst, 0, &[0xAB; 1024]).unwrap();
    staging.submit_all_pending_upload().unwrap();

    let bytes = read_gpu_buffer(&device, &dst);
    assert_eq!(bytes.len(), 1024);
    assert!(bytes.iter().all(|&b| b == 0xAB));
    assert_eq!(staging.batches_submitted(), 1);
}

#[test]
fn upload_at_offset_leaves_the_rest_alone() {
    let device = device();
    let dst = device
        .create_buffer(&BufferDesc {
            name: "partial_dst",
            size: 64,
            usage: BufferUsage::TRANSFER_DST | BufferUsage::TRANSFER_SRC,
            residency: MemoryResidency::GpuOnly,
        })
        .unwrap();

    let mut staging = StagingManager::new(&device, &common::config().staging).unwrap();
    staging.upload_buffer(&dst, 16, &[7; 8]).unwrap();
    staging.submit_all_pending_upload().unwrap();

    let bytes = read_gpu_buffer(&device, &dst);
    assert!(bytes[..16].iter().all(|&b| b == 0));
    assert!(bytes[16..24].iter().all(|&b| b == 7));
    assert!(bytes[24..].iter().all(|&b| b == 0));
}

#[test]
#[should_panic(expected = "pool exhausted")]
fn fifth_staging_buffer_in_one_batch_is_fatal() {
    let device = device();
    let mut staging = StagingManager::new(&device, &common::config().staging).unwrap();
    let _held: Vec<_> = (0..4).map(|_| staging.get_staging_buffer(16).unwrap()).collect();
    let _ = staging.get_staging_buffer(16);
}

#[test]
fn staging_buffers_are_reused_after_a_batch() {
    let device = device();
    let dst = device
        .create_buffer(&BufferDesc {
            name: "reuse_dst",
            size: 256,
            usage: BufferUsage::TRANSFER_DST,
            residency: MemoryResidency::GpuOnly,
        })
        .unwrap();
    let mut staging = StagingManager::new(&device, &common::config().staging).unwrap();

    staging.upload_buffer(&dst, 0, &[1; 128]).unwrap();
    staging.upload_buffer(&dst, 128, &[2; 128]).unwrap();
    assert_eq!(staging.staging_pool_len(), 2);
    assert_eq!(staging.available_staging(), 0);

    staging.submit_all_pending_upload().unwrap();
    assert_eq!(staging.available_staging(), 2);

    for _ in 0..3 {
        staging.upload_buffer(&dst, 0, &[3; 128]).unwrap();
        staging.upload_buffer(&dst, 128, &[4; 128]).unwrap();
        staging.submit_all_pending_upload().unwrap();
    }
    assert_eq!(staging.staging_pool_len(), 2);
    assert_eq!(staging.batches_submitted(), 4);
}

#[test]
fn staging_buffers_are_at_least_one_block() {
    let device = device();
    let mut staging = StagingManager::new(&device, &common::config().staging).unwrap();

    let small = staging.get_staging_buffer(1).unwrap();
    assert_eq!(small.size(), BLOCK_SIZE);
    assert!(small.residency().is_host_visible());

    let large = staging.get_staging_buffer(BLOCK_SIZE * 3).unwrap();
    assert_eq!(large.size(), BLOCK_SIZE * 3);
}

#[test]
fn submitting_an_empty_batch_only_frees_entries() {
    let device = device();
    let mut staging = StagingManager::new(&device, &common::config().staging).unwrap();
    let _scratch = staging.get_scratch_buffer(512).unwrap();
    assert_eq!(staging.available_scratch(), 0);

    staging.submit_all_pending_upload().unwrap();
    assert_eq!(staging.available_scratch(), 1);
    assert_eq!(staging.batches_submitted(), 0);
    assert_eq!(device.raw().stats().submissions, 0);
}

#[test]
fn texture_upload_and_readback() {
    let device = device();
    let texture = device
        .create_texture(&TextureDesc {
            name: "albedo",
            extent: Extent3d::new_2d(4, 4),
            format: Format::Rgba8Unorm,
            usage: TextureUsage::SAMPLED | TextureUsage::TRANSFER_DST | TextureUsage::TRANSFER_SRC,
            mip_levels: 1,
            initial_state: ResourceState::ReadOnly,
        })
        .unwrap();
    let pixels: Vec<u8> = (0..texture.mip_size(0) as u32).map(|i| i as u8).collect();

    let mut staging = StagingManager::new(&device, &common::config().staging).unwrap();
    staging
        .upload_texture(&texture, &pixels, ResourceState::ReadOnly, ResourceState::TransferSrc)
        .unwrap();
    staging.submit_all_pending_upload().unwrap();

    let readback = readback_buffer(&device, "texels", texture.mip_size(0));
    device
        .one_time_command_submit(QueueType::Graphics, |cmd| {
            cmd.copy_texture_to_buffer(&texture, 0, &readback, 0);
        })
        .unwrap();
    assert_eq!(readback.read_to_vec().unwrap(), pixels);
}

#[test]
fn mip_levels_are_copied_independently() {
    let device = device();
    let texture = device
        .create_texture(&TextureDesc {
            name: "mipped",
            extent: Extent3d::new_2d(4, 4),
            format: Format::R8Unorm,
            usage: TextureUsage::TRANSFER_DST | TextureUsage::TRANSFER_SRC,
            mip_levels: 3,
            initial_state: ResourceState::None,
        })
        .unwrap();
    assert_eq!(texture.mip_size(0), 16);
    assert_eq!(texture.mip_size(1), 4);
    assert_eq!(texture.mip_size(2), 1);

    let source = device
        .create_buffer_with_data("mip1_texels", BufferUsage::TRANSFER_SRC, &[9; 4])
        .unwrap();
    let readback = readback_buffer(&device, "mip_readback", 16 + 4);
    device
        .one_time_command_submit(QueueType::Graphics, |cmd| {
            cmd.texture_barrier(&texture, ResourceState::None, ResourceState::TransferDst);
            cmd.copy_buffer_to_texture(&source, 0, &texture, 1);
            cmd.texture_barrier(&texture, ResourceState::TransferDst, ResourceState::TransferSrc);
            cmd.copy_texture_to_buffer(&texture, 0, &readback, 0);
            cmd.copy_texture_to_buffer(&texture, 1, &readback, 16);
        })
        .unwrap();

    let bytes = readback.read_to_vec().unwrap();
    assert!(bytes[..16].iter().all(|&b| b == 0));
    assert_eq!(&bytes[16..], &[9; 4]);
}

#[test]
fn growing_requests_across_batches_stay_within_the_pool() {
    let device = device();
    let mut staging = StagingManager::new(&device, &common::config().staging).unwrap();

    for step in 1..=8u64 {
        let scratch = staging.get_scratch_buffer(100 * step).unwrap();
        assert!(scratch.size() >= 100 * step);
        let block = staging.get_staging_buffer(BLOCK_SIZE * step).unwrap();
        assert!(block.size() >= BLOCK_SIZE * step);
        drop((scratch, block));
        staging.submit_all_pending_upload().unwrap();
    }
    assert!(staging.scratch_pool_len() <= 4);
    assert!(staging.staging_pool_len() <= 4);
    assert_eq!(staging.available_scratch(), staging.scratch_pool_len());
}
