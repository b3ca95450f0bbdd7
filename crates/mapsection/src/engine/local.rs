use super::ComputeEngine;
use crate::{
    EngineError, MapCalcSettings, MapSectionRequest, MapSectionResponse, MapSectionVectors, SizeInt,
};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Scale applied to the fractional escape velocity before it is stored.
pub const ESCAPE_VELOCITY_SCALE: f64 = 10_000.0;

/// A double-precision escape-time engine that runs on the blocking pool.
///
/// Pixels already marked done in a partial payload keep their counts; the
/// rest are iterated from scratch up to the requested target. The token is
/// checked once per row; a cancelled run returns what it has with
/// `request_completed == false`.
#[derive(Clone, Debug)]
pub struct LocalEngine {
    address: String,
}

impl LocalEngine {
    pub fn new() -> Self {
        Self::with_address("localhost")
    }

    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ComputeEngine for LocalEngine {
    fn endpoint_address(&self) -> &str {
        &self.address
    }

    async fn generate(
        &self,
        request: &mut MapSectionRequest,
        token: &CancellationToken,
    ) -> Result<MapSectionResponse, EngineError> {
        let block = Block {
            size: request.block_size,
            origin: (
                request.map_position.x.to_f64(),
                request.map_position.y.to_f64(),
            ),
            delta: (
                request.sample_point_delta.width.to_f64(),
                request.sample_point_delta.height.to_f64(),
            ),
            settings: request.map_calc_settings,
        };
        let seed = request
            .vectors
            .take()
            .filter(|v| v.block_size == block.size && v.len() == block.size.pixel_count());
        let token = token.clone();

        let (vectors, completed) = tokio::task::spawn_blocking(move || block.iterate(seed, &token))
            .await
            .map_err(|e| EngineError::Failed {
                reason: format!("local engine task failed: {e}"),
            })?;

        Ok(MapSectionResponse::new(
            request,
            request.map_calc_settings,
            vectors,
            completed,
        ))
    }
}

struct Block {
    size: SizeInt,
    origin: (f64, f64),
    delta: (f64, f64),
    settings: MapCalcSettings,
}

impl Block {
    fn iterate(
        &self,
        seed: Option<MapSectionVectors>,
        token: &CancellationToken,
    ) -> (MapSectionVectors, bool) {
        let mut vectors = seed.unwrap_or_else(|| MapSectionVectors::new(self.size));
        vectors.expand_done_flags();

        let width = self.size.width as usize;
        let threshold = f64::from(self.settings.threshold.max(1));
        let target = self.settings.target_iterations;

        for row in 0..self.size.height as usize {
            if token.is_cancelled() {
                return (vectors, false);
            }
            let cy = self.delta.1.mul_add(row as f64, self.origin.1);
            for col in 0..width {
                let idx = row * width + col;
                if vectors.done_flags[idx] {
                    continue;
                }
                let cx = self.delta.0.mul_add(col as f64, self.origin.0);
                let (count, escaped, velocity) = escape_time(cx, cy, target, threshold);
                vectors.counts[idx] = count;
                vectors.escape_velocities[idx] = velocity;
                vectors.done_flags[idx] = escaped;
            }
        }
        (vectors, true)
    }
}

/// Iterates `z = z^2 + c` and returns the iteration count, whether the point
/// escaped, and its scaled fractional escape velocity.
fn escape_time(cx: f64, cy: f64, target: u32, threshold: f64) -> (u32, bool, u16) {
    let (mut zx, mut zy) = (0.0_f64, 0.0_f64);
    let mut count = 0;
    while count < target {
        let zx2 = zx * zx;
        let zy2 = zy * zy;
        let magnitude = zx2 + zy2;
        if magnitude > threshold {
            let fraction = 1.0 - (magnitude.ln() / 2.0).ln() / core::f64::consts::LN_2;
            let velocity = (fraction.clamp(0.0, 1.0) * (ESCAPE_VELOCITY_SCALE - 1.0)) as u16;
            return (count, true, velocity);
        }
        zy = (2.0 * zx).mul_add(zy, cy);
        zx = zx2 - zy2 + cx;
        count += 1;
    }
    (count, false, 0)
}
