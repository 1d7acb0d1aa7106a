use crate::{BowErr, BowResult, Desc, DESC_LEN};
use tracing::debug;

/// Size assigned to every decoded keypoint.
pub const KEYPOINT_SIZE: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
/// A raw detection in network grid coordinates.
///
/// The score is carried along but never consulted: suppression is greedy
/// in input order.
pub struct Detection {
    pub x: i32,
    pub y: i32,
    pub score: f32,
}

impl Detection {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y, score: 0. }
    }

    /// Build from one `(x, y, score)` row of the detection tensor. Coordinates are truncated.
    pub fn from_row(row: [f32; 3]) -> Self {
        Self {
            x: row[0] as i32,
            y: row[1] as i32,
            score: row[2],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
/// A surviving keypoint in source image pixel coordinates.
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub size: f32,
}

#[derive(Debug, Clone, PartialEq)]
/// Raw output of the keypoint network: `N` detections and an `N x desc_width`
/// descriptor table, row aligned.
pub struct NetworkOutput {
    pub detections: Vec<Detection>,
    pub descriptors: Vec<u8>,
    pub desc_width: usize,
}

impl NetworkOutput {
    /// Wrap the flat `N x 3` detection buffer and the `N x desc_width` descriptor buffer
    /// produced by the network.
    pub fn from_raw(detections: &[f32], descriptors: Vec<u8>, desc_width: usize) -> BowResult<Self> {
        if detections.len() % 3 != 0 {
            return Err(BowErr::Precondition(format!(
                "detection buffer length {} is not a multiple of 3",
                detections.len()
            )));
        }
        let detections = detections
            .chunks_exact(3)
            .map(|r| Detection::from_row([r[0], r[1], r[2]]))
            .collect();
        Ok(Self {
            detections,
            descriptors,
            desc_width,
        })
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
/// Parameters of one decode call.
pub struct NmsParams {
    /// Network grid width.
    pub width: usize,
    /// Network grid height.
    pub height: usize,
    /// Keypoints closer than this to the grid edge are dropped.
    pub border: usize,
    /// Suppression radius.
    pub min_distance: usize,
    /// Scale from grid to source image, x axis.
    pub ratio_x: f32,
    /// Scale from grid to source image, y axis.
    pub ratio_y: f32,
}

impl NmsParams {
    pub fn new(width: usize, height: usize, border: usize, min_distance: usize) -> Self {
        Self {
            width,
            height,
            border,
            min_distance,
            ratio_x: 1.,
            ratio_y: 1.,
        }
    }

    /// Set the ratios mapping grid coordinates back to a `src_width x src_height` image.
    pub fn scaled_to(mut self, src_width: usize, src_height: usize) -> Self {
        self.ratio_x = src_width as f32 / self.width as f32;
        self.ratio_y = src_height as f32 / self.height as f32;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cell {
    Empty,
    Occupied,
    Selected,
}

/// Occupancy and index grids padded by the suppression radius on every side.
struct SuppressionGrid {
    cells: Vec<Cell>,
    inds: Vec<u32>,
    stride: usize,
    margin: usize,
}

impl SuppressionGrid {
    fn new(width: usize, height: usize, margin: usize) -> Self {
        let stride = width + 2 * margin;
        let size = stride * (height + 2 * margin);
        Self {
            cells: vec![Cell::Empty; size],
            inds: vec![0; size],
            stride,
            margin,
        }
    }

    /// Offset of grid position `(x, y)` in the padded buffers.
    #[inline]
    fn offset(&self, x: usize, y: usize) -> usize {
        (y + self.margin) * self.stride + x + self.margin
    }

    fn mark(&mut self, x: usize, y: usize, idx: u32) {
        let o = self.offset(x, y);
        self.cells[o] = Cell::Occupied;
        self.inds[o] = idx;
    }

    /// Select `(x, y)` if still occupied, clearing its neighbourhood. Returns whether it was selected.
    fn select(&mut self, x: usize, y: usize) -> bool {
        let center = self.offset(x, y);
        if self.cells[center] != Cell::Occupied {
            return false;
        }
        let m = self.margin;
        // padded coordinates of the window's top-left corner are (x, y)
        for wy in y..=y + 2 * m {
            let row = wy * self.stride;
            for o in row + x..=row + x + 2 * m {
                if o != center {
                    self.cells[o] = Cell::Empty;
                }
            }
        }
        self.cells[center] = Cell::Selected;
        true
    }
}

/// Turn raw network output into spatially separated keypoints and their descriptors.
///
/// Detections are selected greedily in input order: each one still occupied
/// clears its `(2 * min_distance + 1)^2` neighbourhood. Survivors inside the border
/// are emitted in raster order of the grid, rescaled to source image
/// coordinates, together with a copy of their descriptor row.
///
/// When two detections share a cell, the cell resolves to the later detection's
/// descriptor row.
pub fn decode(output: &NetworkOutput, params: &NmsParams) -> BowResult<(Vec<Keypoint>, Vec<Desc>)> {
    let (width, height) = (params.width, params.height);
    if width == 0 || height == 0 {
        return Err(BowErr::Precondition(format!(
            "image dimensions must be positive, got {}x{}",
            width, height
        )));
    }
    if output.desc_width != DESC_LEN {
        return Err(BowErr::Precondition(format!(
            "descriptor width must be {} bytes, got {}",
            DESC_LEN, output.desc_width
        )));
    }
    let detections = &output.detections;
    if output.descriptors.len() != detections.len() * DESC_LEN {
        return Err(BowErr::Precondition(format!(
            "descriptor table holds {} bytes for {} detections",
            output.descriptors.len(),
            detections.len()
        )));
    }
    if let Some(d) = detections
        .iter()
        .find(|d| d.x < 0 || d.y < 0 || d.x as usize >= width || d.y as usize >= height)
    {
        return Err(BowErr::Precondition(format!(
            "detection ({}, {}) lies outside the {}x{} grid",
            d.x, d.y, width, height
        )));
    }
    if detections.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }

    let mut grid = SuppressionGrid::new(width, height, params.min_distance);
    for (i, d) in detections.iter().enumerate() {
        grid.mark(d.x as usize, d.y as usize, i as u32);
    }
    for d in detections {
        grid.select(d.x as usize, d.y as usize);
    }

    let mut keypoints = Vec::new();
    let mut descriptors: Vec<Desc> = Vec::new();
    for y in params.border..height.saturating_sub(params.border) {
        for x in params.border..width.saturating_sub(params.border) {
            let o = grid.offset(x, y);
            if grid.cells[o] != Cell::Selected {
                continue;
            }
            let i = grid.inds[o] as usize;
            let d = &detections[i];
            keypoints.push(Keypoint {
                x: d.x as f32 * params.ratio_x,
                y: d.y as f32 * params.ratio_y,
                size: KEYPOINT_SIZE,
            });
            let mut desc: Desc = [0; DESC_LEN];
            desc.copy_from_slice(&output.descriptors[i * DESC_LEN..(i + 1) * DESC_LEN]);
            descriptors.push(desc);
        }
    }

    debug!(
        "NMS kept {} of {} detections",
        keypoints.len(),
        detections.len()
    );
    Ok((keypoints, descriptors))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Network output whose descriptor row `i` is filled with byte `i`.
    fn output(points: &[(i32, i32)]) -> NetworkOutput {
        NetworkOutput {
            detections: points.iter().map(|&(x, y)| Detection::new(x, y)).collect(),
            descriptors: (0..points.len())
                .flat_map(|i| std::iter::repeat(i as u8).take(DESC_LEN))
                .collect(),
            desc_width: DESC_LEN,
        }
    }

    fn qvga() -> NmsParams {
        NmsParams::new(320, 240, 8, 4)
    }

    #[test]
    fn close_pair_and_isolated_point() {
        let out = output(&[(10, 10), (11, 11), (100, 100)]);
        let (kps, descs) = decode(&out, &qvga()).unwrap();
        assert_eq!(kps.len(), 2);
        assert_eq!(descs.len(), 2);
        assert_eq!((kps[0].x, kps[0].y), (10., 10.));
        assert_eq!(descs[0], [0; 32]);
        assert_eq!((kps[1].x, kps[1].y), (100., 100.));
        assert_eq!(descs[1], [2; 32]);
    }

    #[test]
    fn duplicate_pixel_keeps_one() {
        let out = output(&[(50, 60), (50, 60)]);
        let (kps, descs) = decode(&out, &qvga()).unwrap();
        assert_eq!(kps.len(), 1);
        // the index grid holds the last detection written to the cell
        assert_eq!(descs[0], [1; 32]);
    }

    #[test]
    fn origin_is_inside_border() {
        let out = output(&[(0, 0)]);
        let (kps, descs) = decode(&out, &qvga()).unwrap();
        assert!(kps.is_empty());
        assert!(descs.is_empty());
    }

    #[test]
    fn separated_points_all_survive() {
        let mut points = Vec::new();
        for y in (20..200).step_by(10) {
            for x in (20..300).step_by(10) {
                points.push((x, y));
            }
        }
        let inside = points.len();
        // border rejects
        points.extend_from_slice(&[(3, 50), (316, 50), (50, 7), (50, 232)]);
        let (kps, descs) = decode(&output(&points), &qvga()).unwrap();
        assert_eq!(kps.len(), inside);
        assert_eq!(descs.len(), inside);
    }

    #[test]
    fn border_is_half_open() {
        let out = output(&[(8, 8), (311, 231), (312, 100), (100, 232)]);
        let (kps, _) = decode(&out, &qvga()).unwrap();
        let kept: Vec<_> = kps.iter().map(|k| (k.x as i32, k.y as i32)).collect();
        assert_eq!(kept, vec![(8, 8), (311, 231)]);
    }

    #[test]
    fn output_follows_raster_order() {
        let out = output(&[(100, 50), (20, 30), (40, 50)]);
        let (kps, descs) = decode(&out, &qvga()).unwrap();
        let kept: Vec<_> = kps.iter().map(|k| (k.x as i32, k.y as i32)).collect();
        assert_eq!(kept, vec![(20, 30), (40, 50), (100, 50)]);
        assert_eq!(descs, vec![[1; 32], [2; 32], [0; 32]]);
    }

    #[test]
    fn selection_ignores_score() {
        let mut out = output(&[(30, 30), (32, 30)]);
        out.detections[1].score = 10.;
        let (kps, _) = decode(&out, &qvga()).unwrap();
        assert_eq!(kps.len(), 1);
        assert_eq!(kps[0].x, 30.);
    }

    #[test]
    fn suppression_is_greedy_not_transitive() {
        // the middle point is suppressed by the first, so the third survives
        let out = output(&[(20, 20), (24, 20), (28, 20)]);
        let (kps, _) = decode(&out, &qvga()).unwrap();
        let kept: Vec<_> = kps.iter().map(|k| k.x as i32).collect();
        assert_eq!(kept, vec![20, 28]);
    }

    #[test]
    fn rescales_to_source_image() {
        let params = qvga().scaled_to(640, 480);
        let (kps, _) = decode(&output(&[(100, 50)]), &params).unwrap();
        assert_eq!(kps[0], Keypoint { x: 200., y: 100., size: KEYPOINT_SIZE });
    }

    #[test]
    fn empty_input() {
        let (kps, descs) = decode(&output(&[]), &qvga()).unwrap();
        assert!(kps.is_empty() && descs.is_empty());
    }

    #[test]
    fn rejects_bad_inputs() {
        let mut out = output(&[(10, 10)]);
        out.desc_width = 64;
        assert!(matches!(decode(&out, &qvga()), Err(BowErr::Precondition(_))));

        let out = output(&[(10, 10)]);
        let params = NmsParams::new(0, 240, 8, 4);
        assert!(matches!(decode(&out, &params), Err(BowErr::Precondition(_))));

        let out = output(&[(320, 10)]);
        assert!(matches!(decode(&out, &qvga()), Err(BowErr::Precondition(_))));

        let mut out = output(&[(10, 10)]);
        out.descriptors.pop();
        assert!(matches!(decode(&out, &qvga()), Err(BowErr::Precondition(_))));
    }

    #[test]
    fn raw_buffers() {
        let out = NetworkOutput::from_raw(&[10.7, 20.2, 0.9, 5., 6., 0.1], vec![0; 64], 32).unwrap();
        assert_eq!(out.detections[0], Detection { x: 10, y: 20, score: 0.9 });
        assert_eq!(out.len(), 2);
        assert!(NetworkOutput::from_raw(&[1., 2.], vec![], 32).is_err());
    }
}
