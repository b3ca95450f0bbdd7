use mapsection::{
    BigVector, JobNumber, MapCalcSettings, MapSectionRequest, RPoint, RSize, SizeInt, SubdivisionId,
};
use num_bigint::BigInt;
use std::collections::HashMap;

/// A rectangular grid of blocks centred on a map point.
#[derive(Debug, Clone)]
pub struct Screen {
    pub subdivision_id: SubdivisionId,
    pub columns: u32,
    pub rows: u32,
    pub block_size: SizeInt,
    pub center: RPoint,
    pub delta: RSize,
}

impl Screen {
    pub const fn tile_count(&self) -> usize {
        self.columns as usize * self.rows as usize
    }

    /// Block positions covered by the screen, row by row from the bottom.
    ///
    /// Block `(0, 0)` has its lower-left sample on the centre point.
    pub fn block_positions(&self) -> impl Iterator<Item = BigVector> + '_ {
        let corner = BigVector::new(-i64::from(self.columns / 2), -i64::from(self.rows / 2));
        (0..i64::from(self.rows)).flat_map(move |row| {
            let corner = corner.clone();
            (0..i64::from(self.columns)).map(move |col| corner.offset(col, row))
        })
    }

    /// Map coordinates of the lower-left sample of `block`.
    pub fn map_position(&self, block: &BigVector) -> RPoint {
        let samples = BigVector {
            x: &block.x * BigInt::from(self.block_size.width),
            y: &block.y * BigInt::from(self.block_size.height),
        };
        self.center.translate(&samples, &self.delta)
    }

    /// One request per block, all under `job` at `target_iterations`.
    ///
    /// When the screen is centred on the real axis, each block below the axis
    /// rides as the mirror of its reflection above it.
    pub fn requests(&self, job: JobNumber, target_iterations: u32) -> Vec<MapSectionRequest> {
        let settings = MapCalcSettings::new(target_iterations);
        let requests = self.block_positions().enumerate().map(|(request_number, block)| {
            let map_position = self.map_position(&block);
            MapSectionRequest::new(
                job,
                request_number,
                self.subdivision_id.clone(),
                block,
                map_position,
                self.delta.clone(),
                settings,
            )
            .with_block_size(self.block_size)
        });
        if !self.center.y.is_zero() {
            return requests.collect();
        }

        let (above, below): (Vec<_>, Vec<_>) =
            requests.partition(|r| r.block_position.y >= BigInt::ZERO);
        let mut below: HashMap<BigVector, MapSectionRequest> = below
            .into_iter()
            .map(|r| (r.block_position.clone(), r))
            .collect();
        let mut paired: Vec<MapSectionRequest> = above
            .into_iter()
            .map(|request| {
                let reflected = BigVector {
                    x: request.block_position.x.clone(),
                    y: -&request.block_position.y - 1,
                };
                match below.remove(&reflected) {
                    Some(mirror) => request.with_mirror(mirror),
                    None => request,
                }
            })
            .collect();
        let mut unpaired: Vec<_> = below.into_values().collect();
        unpaired.sort_by_key(|r| r.request_number);
        paired.extend(unpaired);
        paired
    }
}
