//! Drives a producer/consumer pair through a short frame loop on two
//! threads, printing what each side sees.
//!
//! ```sh
//! cargo run --example frame_loop
//! ```

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;

use flipq::buffer::MemfdAllocator;
use flipq::consumer::BufferQueueConsumer;
use flipq::fence::SyncFence;
use flipq::producer::BufferQueueProducer;
use flipq::queue::{ BufferQueue, ConsumerListener };
use flipq::types::{ BufferFlushConfig, BufferRequestConfig, ExtraData };

struct PrintingListener;

impl ConsumerListener for PrintingListener {
    fn on_buffer_available(&self) {
        tracing::info!("frame available");
    }
}

const FRAMES: u32 = 8;

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();

    let queue = BufferQueue::new("frame-loop", Arc::new(MemfdAllocator::default()));
    queue.register_consumer_listener(Arc::new(PrintingListener));
    let producer = Arc::new(BufferQueueProducer::new(queue.clone()));
    let consumer = BufferQueueConsumer::new(queue.clone());

    let drawer_producer = producer.clone();
    let drawer = thread::spawn(move || -> Result<()> {
        let producer = drawer_producer;
        let config = BufferRequestConfig { width: 640, height: 480, ..Default::default() };
        for frame in 0..FRAMES {
            let reply = producer.request_buffer(&config)?;
            reply.fence.wait(-1);
            reply.buffer.handle().with_bytes_mut(|bytes| {
                bytes.fill((frame % 255) as u8);
            })?;

            let gpu_done = SyncFence::new("gpu");
            gpu_done.signal();
            producer.flush_buffer(
                reply.sequence,
                ExtraData::new(),
                gpu_done,
                &BufferFlushConfig::full_damage(640, 480)
            )?;
            tracing::info!(frame, sequence = reply.sequence, "flushed");
        }
        Ok(())
    });

    for _ in 0..FRAMES {
        loop {
            match consumer.acquire_buffer() {
                Ok(acquired) => {
                    acquired.fence.wait(100);
                    tracing::info!(
                        sequence = acquired.buffer.sequence(),
                        damages = acquired.damages.len(),
                        "composited"
                    );
                    consumer.release_buffer(&acquired.buffer, SyncFence::invalid())?;
                    break;
                }
                Err(_) => thread::sleep(Duration::from_millis(1)),
            }
        }
    }

    drawer.join().expect("drawer thread")?;
    tracing::info!(cached = producer.cached_buffer_count(), "frame loop done");
    Ok(())
}
