//! Built-in primitive shapes used as placeholders

use std::f32::consts::PI;

use crate::asset::geometry::Geometry;
use crate::core::types::{Vec2, Vec3};

/// Axis-aligned box centred on the origin, one flat-shaded quad per face
pub fn box_geometry(size: Vec3) -> Geometry {
    let h = size * 0.5;
    // (normal, tangent u, tangent v) per face
    let faces = [
        (Vec3::X, Vec3::NEG_Z, Vec3::Y),
        (Vec3::NEG_X, Vec3::Z, Vec3::Y),
        (Vec3::Y, Vec3::X, Vec3::NEG_Z),
        (Vec3::NEG_Y, Vec3::X, Vec3::Z),
        (Vec3::Z, Vec3::X, Vec3::Y),
        (Vec3::NEG_Z, Vec3::NEG_X, Vec3::Y),
    ];

    let mut positions = Vec::with_capacity(24);
    let mut normals = Vec::with_capacity(24);
    let mut uvs = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (normal, u, v) in faces {
        let base = positions.len() as u32;
        for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            positions.push((normal + u * su + v * sv) * h);
            normals.push(normal);
            uvs.push(Vec2::new((su + 1.0) * 0.5, (sv + 1.0) * 0.5));
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }

    let mut geometry = Geometry::indexed(positions, indices)
        .with_normals(normals)
        .with_uvs(uvs);
    geometry.compute_bounds();
    geometry
}

/// UV sphere with `segments` around and `rings` from pole to pole
pub fn sphere_geometry(radius: f32, segments: u32, rings: u32) -> Geometry {
    let segments = segments.max(3);
    let rings = rings.max(2);

    let mut positions = Vec::new();
    let mut normals = Vec::new();
    let mut uvs = Vec::new();
    for ring in 0..=rings {
        let v = ring as f32 / rings as f32;
        let theta = v * PI;
        for seg in 0..=segments {
            let u = seg as f32 / segments as f32;
            let phi = u * 2.0 * PI;
            let n = Vec3::new(theta.sin() * phi.cos(), theta.cos(), theta.sin() * phi.sin());
            positions.push(n * radius);
            normals.push(n);
            uvs.push(Vec2::new(u, v));
        }
    }

    let stride = segments + 1;
    let mut indices = Vec::new();
    for ring in 0..rings {
        for seg in 0..segments {
            let a = ring * stride + seg;
            let b = a + stride;
            if ring != 0 {
                indices.extend_from_slice(&[a, b, a + 1]);
            }
            if ring != rings - 1 {
                indices.extend_from_slice(&[a + 1, b, b + 1]);
            }
        }
    }

    let mut geometry = Geometry::indexed(positions, indices)
        .with_normals(normals)
        .with_uvs(uvs);
    geometry.compute_bounds();
    geometry
}

/// Square in the XZ plane facing +Y
pub fn plane_geometry(size: f32) -> Geometry {
    let h = size * 0.5;
    let positions = vec![
        Vec3::new(-h, 0.0, h),
        Vec3::new(h, 0.0, h),
        Vec3::new(h, 0.0, -h),
        Vec3::new(-h, 0.0, -h),
    ];
    let uvs = vec![Vec2::ZERO, Vec2::X, Vec2::ONE, Vec2::Y];
    let mut geometry = Geometry::indexed(positions, vec![0, 1, 2, 0, 2, 3])
        .with_normals(vec![Vec3::Y; 4])
        .with_uvs(uvs);
    geometry.compute_bounds();
    geometry
}
