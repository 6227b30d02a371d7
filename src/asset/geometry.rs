//! CPU-side triangle geometry

use crate::core::error::LoadError;
use crate::core::types::{Vec2, Vec3};
use crate::math::Bounds;

/// Triangle-list geometry, indexed or not
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Geometry {
    pub positions: Vec<Vec3>,
    pub normals: Option<Vec<Vec3>>,
    pub uvs: Option<Vec<Vec2>>,
    pub indices: Option<Vec<u32>>,
    pub bounds: Option<Bounds>,
}

impl Geometry {
    /// Non-indexed geometry; every three positions form a triangle
    pub fn new(positions: Vec<Vec3>) -> Self {
        Self {
            positions,
            ..Default::default()
        }
    }

    /// Indexed geometry
    pub fn indexed(positions: Vec<Vec3>, indices: Vec<u32>) -> Self {
        Self {
            positions,
            indices: Some(indices),
            ..Default::default()
        }
    }

    pub fn with_normals(mut self, normals: Vec<Vec3>) -> Self {
        self.normals = Some(normals);
        self
    }

    pub fn with_uvs(mut self, uvs: Vec<Vec2>) -> Self {
        self.uvs = Some(uvs);
        self
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn is_indexed(&self) -> bool {
        self.indices.is_some()
    }

    /// Number of complete triangles
    pub fn triangle_count(&self) -> usize {
        match &self.indices {
            Some(indices) => indices.len() / 3,
            None => self.positions.len() / 3,
        }
    }

    /// Vertex indices of triangle `i`
    pub fn triangle(&self, i: usize) -> [u32; 3] {
        match &self.indices {
            Some(indices) => [indices[i * 3], indices[i * 3 + 1], indices[i * 3 + 2]],
            None => {
                let base = (i * 3) as u32;
                [base, base + 1, base + 2]
            }
        }
    }

    /// Check attribute lengths and index ranges
    pub fn validate(&self) -> Result<(), LoadError> {
        let n = self.positions.len();
        if self.normals.as_ref().is_some_and(|v| v.len() != n) {
            return Err(LoadError::Decode("normal count does not match position count".into()));
        }
        if self.uvs.as_ref().is_some_and(|v| v.len() != n) {
            return Err(LoadError::Decode("uv count does not match position count".into()));
        }
        if let Some(indices) = &self.indices {
            if indices.len() % 3 != 0 {
                return Err(LoadError::Decode(format!(
                    "index count {} is not a multiple of 3",
                    indices.len()
                )));
            }
            if let Some(bad) = indices.iter().find(|&&i| i as usize >= n) {
                return Err(LoadError::Decode(format!(
                    "index {} out of range for {} vertices",
                    bad, n
                )));
            }
        }
        Ok(())
    }

    /// Recompute bounding box and sphere from positions
    pub fn compute_bounds(&mut self) {
        self.bounds = Bounds::from_points(&self.positions);
    }

    /// Area-weighted vertex normals from triangle faces.
    /// Non-indexed input yields flat face normals.
    pub fn compute_vertex_normals(&mut self) {
        let mut normals = vec![Vec3::ZERO; self.positions.len()];
        for t in 0..self.triangle_count() {
            let [a, b, c] = self.triangle(t).map(|i| i as usize);
            let face = (self.positions[b] - self.positions[a])
                .cross(self.positions[c] - self.positions[a]);
            normals[a] += face;
            normals[b] += face;
            normals[c] += face;
        }
        for n in &mut normals {
            *n = n.normalize_or_zero();
        }
        self.normals = Some(normals);
    }

    /// Bytes this geometry occupies once uploaded as vertex/index buffers
    pub fn byte_size(&self) -> usize {
        let positions = bytemuck::cast_slice::<Vec3, u8>(&self.positions).len();
        let normals = self
            .normals
            .as_deref()
            .map_or(0, |n| bytemuck::cast_slice::<Vec3, u8>(n).len());
        let uvs = self
            .uvs
            .as_deref()
            .map_or(0, |uv| bytemuck::cast_slice::<Vec2, u8>(uv).len());
        let indices = self
            .indices
            .as_deref()
            .map_or(0, |i| bytemuck::cast_slice::<u32, u8>(i).len());
        positions + normals + uvs + indices
    }
}
