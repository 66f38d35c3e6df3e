mod common;

use std::time::Duration;

use my_rhi::{
    BufferDesc, BufferUsage, CommandPool, Fence, MemoryResidency, QueryPool, QueueType, Semaphore,
    WaitStatus,
};

use common::{device, readback_buffer};

const SHORT: Duration = Duration::from_millis(10);

#[test]
fn fence_follows_submit_and_reset() {
    let device = device();
    let mut fence = Fence::new(&device, "frame_fence").unwrap();
    assert_eq!(fence.value(), 1);
    assert!(!fence.is_signaled().unwrap());
    assert_eq!(fence.wait(SHORT).unwrap(), WaitStatus::TimedOut);

    let mut pool = CommandPool::new(&device, "fence_test");
    {
        let cmd = pool.get_command_buffer(QueueType::Graphics).unwrap();
        cmd.begin().unwrap();
        cmd.end().unwrap();
        cmd.submit(Some(&fence), None, None).unwrap();
    }
    assert_eq!(fence.wait(Duration::from_secs(1)).unwrap(), WaitStatus::Signaled);
    assert!(fence.is_signaled().unwrap());
    assert_eq!(fence.completed_value().unwrap(), 1);

    fence.reset();
    assert_eq!(fence.value(), 2);
    assert!(!fence.is_signaled().unwrap());
    assert_eq!(fence.wait(SHORT).unwrap(), WaitStatus::TimedOut);

    pool.reset().unwrap();
    {
        let cmd = pool.get_command_buffer(QueueType::Graphics).unwrap();
        cmd.begin().unwrap();
        cmd.end().unwrap();
        cmd.submit(Some(&fence), None, None).unwrap();
    }
    assert_eq!(fence.wait(SHORT).unwrap(), WaitStatus::Signaled);
    assert_eq!(fence.completed_value().unwrap(), 2);
}

#[test]
fn semaphore_orders_work_across_queues() {
    let device = device();
    let payload = device
        .create_buffer_with_data("payload", BufferUsage::TRANSFER_SRC, &[7; 16])
        .unwrap();
    let shared = device
        .create_buffer(&BufferDesc {
            name: "shared",
            size: 16,
            usage: BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
            residency: MemoryResidency::GpuOnly,
        })
        .unwrap();
    let result = readback_buffer(&device, "result", 16);

    let semaphore = Semaphore::new(&device, "payload_ready").unwrap();
    let fence = Fence::new(&device, "consumer_done").unwrap();
    let mut pool = CommandPool::new(&device, "cross_queue");

    // Consumer first: it must not run until the producer signals
    {
        let consumer = pool.get_command_buffer(QueueType::Compute).unwrap();
        consumer.begin().unwrap();
        consumer.copy_buffer(&shared, 0, &result, 0, 16);
        consumer.end().unwrap();
        consumer.submit(Some(&fence), Some(&semaphore), None).unwrap();
    }
    assert_eq!(device.raw().pending_submissions(), 1);
    assert!(!fence.is_signaled().unwrap());
    assert!(device.queue(QueueType::Compute).wait_idle().is_err());
    assert!(device.wait_idle().is_err());

    {
        let producer = pool.get_command_buffer(QueueType::Graphics).unwrap();
        producer.begin().unwrap();
        producer.copy_buffer(&payload, 0, &shared, 0, 16);
        producer.end().unwrap();
        producer.submit(None, None, Some(&semaphore)).unwrap();
    }
    assert_eq!(fence.wait(Duration::from_secs(1)).unwrap(), WaitStatus::Signaled);
    assert_eq!(device.raw().pending_submissions(), 0);
    assert_eq!(result.read_to_vec().unwrap(), vec![7; 16]);
    device.wait_idle().unwrap();
}

#[test]
fn blocked_submission_holds_back_its_queue() {
    let device = device();
    let semaphore = Semaphore::new(&device, "gate").unwrap();
    let first = Fence::new(&device, "first").unwrap();
    let second = Fence::new(&device, "second").unwrap();
    let mut pool = CommandPool::new(&device, "fifo");

    for (fence, wait) in [(&first, Some(&semaphore)), (&second, None)] {
        let cmd = pool.get_command_buffer(QueueType::Transfer).unwrap();
        cmd.begin().unwrap();
        cmd.end().unwrap();
        cmd.submit(Some(fence), wait, None).unwrap();
    }
    assert_eq!(device.raw().pending_submissions(), 2);
    assert!(!second.is_signaled().unwrap());

    let cmd = pool.get_command_buffer(QueueType::Graphics).unwrap();
    cmd.begin().unwrap();
    cmd.end().unwrap();
    cmd.submit(None, None, Some(&semaphore)).unwrap();

    assert!(first.is_signaled().unwrap());
    assert!(second.is_signaled().unwrap());
}

#[test]
fn timestamps_are_monotonic() {
    let device = device();
    let queries = QueryPool::new(&device, "frame_timestamps", 4).unwrap();
    let src = device
        .create_buffer_with_data("timed_src", BufferUsage::TRANSFER_SRC, &[1; 256])
        .unwrap();
    let dst = readback_buffer(&device, "timed_dst", 256);
    let fence = Fence::new(&device, "timed").unwrap();

    let mut pool = CommandPool::new(&device, "timing");
    {
        let cmd = pool.get_command_buffer(QueueType::Graphics).unwrap();
        cmd.begin().unwrap();
        cmd.reset_query_pool(&queries);
        assert!(queries.is_ready());
        cmd.write_timestamp(&queries, 0);
        cmd.copy_buffer(&src, 0, &dst, 0, 256);
        cmd.write_timestamp(&queries, 1);
        cmd.write_timestamp(&queries, 2);
        cmd.end().unwrap();
        assert!(!queries.is_ready());
        cmd.submit(Some(&fence), None, None).unwrap();
    }
    assert_eq!(fence.wait(Duration::from_secs(1)).unwrap(), WaitStatus::Signaled);

    let ticks = queries.results(0, 3).unwrap();
    assert!(ticks.windows(2).all(|w| w[0] <= w[1]), "{:?}", ticks);
    assert!(queries.results(3, 1).is_err(), "slot 3 was never written");
    assert!(queries.results(0, 0).unwrap().is_empty());
}

#[test]
fn clock_calibration_pairs_both_domains() {
    let device = device();
    let calibration = device.calibrate_clocks().unwrap();
    assert_eq!(device.timestamp_period(), 1.0);
    // One host clock backs both domains here
    assert_eq!(calibration.cpu_ns, calibration.gpu_ticks);

    let later = device.calibrate_clocks().unwrap();
    assert!(later.gpu_ticks >= calibration.gpu_ticks);
}

#[test]
fn timestamp_read_blocks_until_queued_work_runs() {
    let device = device();
    let queries = QueryPool::new(&device, "gated_timestamps", 2).unwrap();
    let gate = Semaphore::new(&device, "gate").unwrap();
    let mut pool = CommandPool::new(&device, "gated");
    {
        let cmd = pool.get_command_buffer(QueueType::Compute).unwrap();
        cmd.begin().unwrap();
        cmd.reset_query_pool(&queries);
        cmd.write_timestamp(&queries, 0);
        cmd.write_timestamp(&queries, 1);
        cmd.end().unwrap();
        cmd.submit(None, Some(&gate), None).unwrap();
    }
    assert_eq!(device.raw().pending_submissions(), 1);

    let ticks = std::thread::scope(|scope| {
        let reader = scope.spawn(|| queries.results(0, 2));
        std::thread::sleep(SHORT);
        let cmd = pool.get_command_buffer(QueueType::Graphics).unwrap();
        cmd.begin().unwrap();
        cmd.end().unwrap();
        cmd.submit(None, None, Some(&gate)).unwrap();
        reader.join().unwrap()
    })
    .unwrap();

    assert_eq!(ticks.len(), 2);
    assert!(ticks[0] <= ticks[1]);
    assert_eq!(device.raw().pending_submissions(), 0);
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "written before reset")]
fn timestamps_need_a_recorded_reset() {
    let device = device();
    let queries = QueryPool::new(&device, "unreset", 2).unwrap();
    let _ = device.one_time_command_submit(QueueType::Graphics, |cmd| {
        cmd.write_timestamp(&queries, 0);
    });
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "written before reset")]
fn ended_recording_makes_the_pool_stale_again() {
    let device = device();
    let queries = QueryPool::new(&device, "frame_queries", 2).unwrap();
    device
        .one_time_command_submit(QueueType::Graphics, |cmd| {
            cmd.reset_query_pool(&queries);
            cmd.write_timestamp(&queries, 0);
        })
        .unwrap();
    let _ = device.one_time_command_submit(QueueType::Graphics, |cmd| {
        cmd.write_timestamp(&queries, 1);
    });
}
