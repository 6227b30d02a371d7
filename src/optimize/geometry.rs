//! Deterministic stride-based decimation
//!
//! Decimation keeps every `stride`-th whole triangle, so the output is a
//! subset of the input primitives and identical input always produces
//! identical output.

use rayon::prelude::*;

use crate::asset::geometry::Geometry;
use crate::core::types::{Vec2, Vec3};

/// Lower bound on the triangle target of any LOD level
pub const MIN_LOD_TRIANGLES: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeometryOptions {
    pub max_triangles: usize,
    pub preserve_uvs: bool,
    pub preserve_normals: bool,
}

impl Default for GeometryOptions {
    fn default() -> Self {
        Self {
            max_triangles: 50_000,
            preserve_uvs: true,
            preserve_normals: true,
        }
    }
}

/// Reduce `geometry` to at most `options.max_triangles` triangles.
///
/// Geometry already within budget is returned unchanged, and a zero budget
/// yields an empty geometry. Otherwise the result is non-indexed, normals are
/// recomputed when not preserved or missing, and bounds are recomputed.
///
/// Malformed input never panics: attribute arrays whose length does not match
/// the positions are dropped, and triangles referencing missing vertices are
/// skipped.
pub fn optimize_geometry(geometry: &Geometry, options: &GeometryOptions) -> Geometry {
    let triangles = geometry.triangle_count();
    if triangles <= options.max_triangles {
        return geometry.clone();
    }
    if options.max_triangles == 0 {
        log::trace!("Decimated {} -> 0 triangles (zero budget)", triangles);
        return Geometry::new(Vec::new());
    }

    let stride = triangles.div_ceil(options.max_triangles);
    let kept = triangles.div_ceil(stride);

    let vertex_count = geometry.positions.len();
    let matching = |len: usize| len == vertex_count;
    let uv_source = geometry.uvs.as_ref().filter(|v| matching(v.len()));
    let normal_source = geometry.normals.as_ref().filter(|v| matching(v.len()));
    if geometry.uvs.is_some() != uv_source.is_some() || geometry.normals.is_some() != normal_source.is_some() {
        log::warn!("Dropping vertex attributes that do not match {} positions", vertex_count);
    }
    let uv_source = uv_source.filter(|_| options.preserve_uvs);
    let normal_source = normal_source.filter(|_| options.preserve_normals);

    let mut positions = Vec::with_capacity(kept * 3);
    let mut uvs: Vec<Vec2> = Vec::with_capacity(if uv_source.is_some() { kept * 3 } else { 0 });
    let mut normals: Vec<Vec3> = Vec::with_capacity(if normal_source.is_some() { kept * 3 } else { 0 });
    let mut skipped = 0usize;

    for t in (0..triangles).step_by(stride) {
        let corners = geometry.triangle(t).map(|index| index as usize);
        if corners.iter().any(|&i| i >= vertex_count) {
            skipped += 1;
            continue;
        }
        for i in corners {
            positions.push(geometry.positions[i]);
            if let Some(src) = uv_source {
                uvs.push(src[i]);
            }
            if let Some(src) = normal_source {
                normals.push(src[i]);
            }
        }
    }
    if skipped > 0 {
        log::warn!("Skipped {} triangles with out-of-range vertices", skipped);
    }

    let mut result = Geometry::new(positions);
    if uv_source.is_some() {
        result.uvs = Some(uvs);
    }
    if normal_source.is_some() {
        result.normals = Some(normals);
    } else {
        result.compute_vertex_normals();
    }
    result.compute_bounds();

    log::trace!(
        "Decimated {} -> {} triangles (stride {})",
        triangles,
        result.triangle_count(),
        stride
    );
    result
}

/// One decimated geometry per ratio, ordered from highest to lowest detail.
///
/// Each level is an independent pass against `base * ratio` triangles, never
/// below [`MIN_LOD_TRIANGLES`]. Levels are built in parallel.
pub fn create_lod_levels(geometry: &Geometry, ratios: &[f32], base: &GeometryOptions) -> Vec<Geometry> {
    create_lod_levels_with_floor(geometry, ratios, base, MIN_LOD_TRIANGLES)
}

/// [`create_lod_levels`] with a custom triangle floor
pub fn create_lod_levels_with_floor(
    geometry: &Geometry,
    ratios: &[f32],
    base: &GeometryOptions,
    min_triangles: usize,
) -> Vec<Geometry> {
    let base_triangles = geometry.triangle_count();
    let mut ordered: Vec<f32> = ratios.to_vec();
    ordered.sort_by(|a, b| b.total_cmp(a));

    ordered
        .par_iter()
        .map(|&ratio| {
            let target = ((base_triangles as f32 * ratio).floor() as usize).max(min_triangles);
            let options = GeometryOptions {
                max_triangles: target.min(base.max_triangles.max(min_triangles)),
                ..*base
            };
            optimize_geometry(geometry, &options)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Flat grid of `n * n * 2` triangles with uvs
    fn grid(n: u32) -> Geometry {
        let mut positions = Vec::new();
        let mut uvs = Vec::new();
        for y in 0..=n {
            for x in 0..=n {
                positions.push(Vec3::new(x as f32, y as f32, 0.0));
                uvs.push(Vec2::new(x as f32 / n as f32, y as f32 / n as f32));
            }
        }
        let mut indices = Vec::new();
        let row = n + 1;
        for y in 0..n {
            for x in 0..n {
                let i = y * row + x;
                indices.extend_from_slice(&[i, i + 1, i + row + 1, i, i + row + 1, i + row]);
            }
        }
        Geometry::indexed(positions, indices).with_uvs(uvs)
    }

    #[test]
    fn test_within_budget_is_unchanged() {
        let g = grid(4); // 32 triangles
        let out = optimize_geometry(&g, &GeometryOptions { max_triangles: 32, ..Default::default() });
        assert_eq!(out, g);
        assert_eq!(out.vertex_count(), g.vertex_count());
        assert_eq!(out.triangle_count(), g.triangle_count());
    }

    #[test]
    fn test_decimation_respects_budget() {
        let g = grid(20); // 800 triangles
        for budget in [1, 7, 100, 399, 400, 799] {
            let out = optimize_geometry(&g, &GeometryOptions { max_triangles: budget, ..Default::default() });
            assert!(out.triangle_count() <= budget, "budget {} gave {}", budget, out.triangle_count());
            assert!(out.triangle_count() > 0);
            assert_eq!(out.positions.len() % 3, 0); // whole triangles only
            assert!(out.validate().is_ok());
        }
    }

    #[test]
    fn test_zero_budget_yields_empty_geometry() {
        let g = grid(4);
        let out = optimize_geometry(&g, &GeometryOptions { max_triangles: 0, ..Default::default() });
        assert_eq!(out.triangle_count(), 0);
        assert!(out.positions.is_empty());
        assert!(out.validate().is_ok());
    }

    #[test]
    fn test_malformed_geometry_does_not_panic() {
        let mut g = grid(10); // 200 triangles
        g.uvs = Some(vec![Vec2::ZERO; 3]);
        g.normals = Some(vec![Vec3::Y; 5]);
        let out = optimize_geometry(&g, &GeometryOptions { max_triangles: 20, ..Default::default() });
        assert!(out.uvs.is_none());
        assert_eq!(out.normals.as_ref().map(Vec::len), Some(out.positions.len()));
        assert!(out.triangle_count() > 0 && out.triangle_count() <= 20);
        assert!(out.validate().is_ok());

        let mut broken = grid(10);
        if let Some(indices) = broken.indices.as_mut() {
            indices.iter_mut().step_by(7).for_each(|i| *i = 10_000);
        }
        let out = optimize_geometry(&broken, &GeometryOptions { max_triangles: 20, ..Default::default() });
        assert!(out.triangle_count() <= 20);
        assert!(out.validate().is_ok());
    }

    #[test]
    fn test_decimation_is_deterministic() {
        let g = grid(16);
        let options = GeometryOptions { max_triangles: 100, ..Default::default() };
        assert_eq!(optimize_geometry(&g, &options), optimize_geometry(&g, &options));
    }

    #[test]
    fn test_attributes_follow_options() {
        let g = grid(10);
        let kept = optimize_geometry(&g, &GeometryOptions { max_triangles: 50, ..Default::default() });
        assert!(kept.uvs.is_some());
        assert!(kept.normals.is_some()); // missing -> recomputed
        assert!(kept.bounds.is_some());

        let dropped = optimize_geometry(
            &g,
            &GeometryOptions { max_triangles: 50, preserve_uvs: false, preserve_normals: false },
        );
        assert!(dropped.uvs.is_none());
        assert!(dropped.normals.is_some());
    }

    #[test]
    fn test_preserved_normals_are_copied() {
        let mut g = grid(10);
        g.normals = Some(vec![Vec3::new(0.0, 1.0, 0.0); g.vertex_count()]);
        let out = optimize_geometry(&g, &GeometryOptions { max_triangles: 20, ..Default::default() });
        assert!(out.normals.unwrap().iter().all(|n| *n == Vec3::Y));
    }

    #[test]
    fn test_lod_levels_ordered_and_floored() {
        let g = grid(30); // 1800 triangles
        let lods = create_lod_levels(&g, &[0.25, 1.0, 0.5, 0.01], &GeometryOptions::default());
        assert_eq!(lods.len(), 4);
        assert_eq!(lods[0].triangle_count(), 1800);
        assert!(lods[1].triangle_count() <= 900);
        assert!(lods[2].triangle_count() <= 450);
        // 0.01 * 1800 = 18, floored to 100
        assert!(lods[3].triangle_count() <= 100);
        assert!(lods[3].triangle_count() > 18);
        for pair in lods.windows(2) {
            assert!(pair[0].triangle_count() >= pair[1].triangle_count());
        }
    }

    #[test]
    fn test_lod_levels_small_geometry_unchanged() {
        let g = grid(5); // 50 triangles, below the floor
        let lods = create_lod_levels(&g, &[1.0, 0.5], &GeometryOptions::default());
        assert!(lods.iter().all(|l| *l == g));
    }
}
