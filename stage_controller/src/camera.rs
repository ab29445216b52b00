//! Camera collaborator interface. The physical driver lives outside
//! this crate; the controller only needs capture, external-trigger
//! arming and a free-running stream.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// One captured image, row-major 8-bit pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), (width * height) as usize);
        Self {
            width,
            height,
            data,
        }
    }

    /// Centered crop, clamped to the frame bounds.
    pub fn crop_centered(&self, width: u32, height: u32) -> Frame {
        let width = width.min(self.width);
        let height = height.min(self.height);
        let x0 = (self.width - width) / 2;
        let y0 = (self.height - height) / 2;

        let mut data = Vec::with_capacity((width * height) as usize);
        for row in y0..y0 + height {
            let start = (row * self.width + x0) as usize;
            data.extend_from_slice(&self.data[start..start + width as usize]);
        }

        Frame {
            width,
            height,
            data,
        }
    }
}

#[async_trait]
pub trait Camera: Send + Sync {
    /// Software-triggered exposure; resolves once the frame is read out.
    async fn capture_frame(&self) -> anyhow::Result<Frame>;

    /// Arm for an externally generated trigger pulse delayed by
    /// `delay`; resolves once the triggered exposure is read out.
    async fn arm_hardware_trigger(&self, delay: Duration) -> anyhow::Result<Frame>;

    /// Free-running acquisition; frames arrive on the returned channel
    /// until the camera is dropped.
    async fn start_continuous_stream(&self) -> anyhow::Result<mpsc::Receiver<Frame>>;

    fn sensor_size(&self) -> (u32, u32);
}

/// Deterministic stand-in camera for bring-up without hardware:
/// produces a shifting gradient so successive frames differ.
pub struct SimulatedCamera {
    width: u32,
    height: u32,
    counter: AtomicU8,
    stream_period: Duration,
}

impl SimulatedCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            counter: AtomicU8::new(0),
            stream_period: Duration::from_millis(100),
        }
    }

    fn render(&self) -> Frame {
        let shift = self.counter.fetch_add(1, Ordering::Relaxed);
        let data = (0..self.width * self.height)
            .map(|i| (i as u8).wrapping_add(shift))
            .collect();
        Frame::new(self.width, self.height, data)
    }
}

#[async_trait]
impl Camera for SimulatedCamera {
    async fn capture_frame(&self) -> anyhow::Result<Frame> {
        Ok(self.render())
    }

    async fn arm_hardware_trigger(&self, delay: Duration) -> anyhow::Result<Frame> {
        tokio::time::sleep(delay).await;
        Ok(self.render())
    }

    async fn start_continuous_stream(&self) -> anyhow::Result<mpsc::Receiver<Frame>> {
        let (tx, rx) = mpsc::channel(4);
        let width = self.width;
        let height = self.height;
        let period = self.stream_period;

        tokio::spawn(async move {
            let mut shift = 0u8;
            loop {
                let data = (0..width * height)
                    .map(|i| (i as u8).wrapping_add(shift))
                    .collect();
                shift = shift.wrapping_add(1);

                if tx.send(Frame::new(width, height, data)).await.is_err() {
                    break;
                }
                tokio::time::sleep(period).await;
            }
        });

        Ok(rx)
    }

    fn sensor_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
