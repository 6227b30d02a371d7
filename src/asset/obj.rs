//! Wavefront OBJ decoder
//!
//! Parsing and triangulation are done by `tobj` with single-index output, so
//! each vertex carries one position, uv and normal. Every model becomes a
//! child node with one primitive. Materials come from `usemtl` names when a
//! `mtllib` resolves; payloads arrive without sidecar files, so most models
//! use the default material.

use std::collections::HashMap;
use std::io::Cursor;

use crate::asset::geometry::Geometry;
use crate::asset::material::MaterialDesc;
use crate::asset::model::{MeshPrimitive, ModelNode};
use crate::asset::source::AssetDecoder;
use crate::core::error::LoadError;
use crate::core::types::{Vec2, Vec3};

/// Decoder for textual OBJ assets
#[derive(Clone, Copy, Debug, Default)]
pub struct ObjDecoder;

impl AssetDecoder for ObjDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<ModelNode, LoadError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| LoadError::Decode(format!("OBJ is not UTF-8: {}", e)))?;

        let options = tobj::LoadOptions {
            triangulate: true,
            single_index: true,
            ..Default::default()
        };
        // Payloads are self-contained, a referenced mtllib cannot be opened
        let (models, materials) = tobj::load_obj_buf(&mut Cursor::new(text), &options, |path| {
            log::debug!("Skipping material library {}", path.display());
            Ok((Vec::new(), HashMap::new()))
        })
        .map_err(|e| LoadError::Decode(format!("OBJ parse failed: {}", e)))?;
        let materials = materials.unwrap_or_default();

        let mut root = ModelNode::new("root");
        for model in models {
            let material = model
                .mesh
                .material_id
                .and_then(|id| materials.get(id))
                .map_or("default", |m| m.name.as_str());
            if let Some(node) = model_node(model.name.clone(), &model.mesh, material)? {
                root.children.push(node);
            }
        }

        if root.children.is_empty() {
            return Err(LoadError::Decode("OBJ contains no faces".into()));
        }
        Ok(root)
    }
}

fn model_node(name: String, mesh: &tobj::Mesh, material: &str) -> Result<Option<ModelNode>, LoadError> {
    if mesh.indices.is_empty() {
        return Ok(None);
    }
    let positions = mesh
        .positions
        .chunks_exact(3)
        .map(|p| Vec3::new(p[0], p[1], p[2]))
        .collect();
    let mut geometry = Geometry::indexed(positions, mesh.indices.clone());

    if !mesh.texcoords.is_empty() {
        geometry.uvs = Some(mesh.texcoords.chunks_exact(2).map(|t| Vec2::new(t[0], t[1])).collect());
    }
    if mesh.normals.is_empty() {
        geometry.compute_vertex_normals();
    } else {
        geometry.normals = Some(
            mesh.normals
                .chunks_exact(3)
                .map(|n| Vec3::new(n[0], n[1], n[2]))
                .collect(),
        );
    }
    geometry.validate()?;
    geometry.compute_bounds();

    let mut node = ModelNode::new(name);
    node.primitives.push(MeshPrimitive {
        geometry,
        material: MaterialDesc::named(material),
    });
    Ok(Some(node))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CUBE_FACE: &str = "\
# a quad
o panel
v 0 0 0
v 1 0 0
v 1 1 0
v 0 1 0
vt 0 0
vt 1 0
vt 1 1
vt 0 1
f 1/1 2/2 3/3 4/4
";

    #[test]
    fn test_quad_is_triangulated() {
        let root = ObjDecoder.decode(CUBE_FACE.as_bytes()).unwrap();
        assert_eq!(root.children.len(), 1);
        assert_eq!(root.children[0].name, "panel");
        let geometry = &root.children[0].primitives[0].geometry;
        assert_eq!(geometry.triangle_count(), 2);
        assert_eq!(geometry.vertex_count(), 4);
        assert!(geometry.uvs.is_some());
        assert!(geometry.normals.is_some()); // computed
        assert!(geometry.bounds.is_some());
        assert!(geometry.validate().is_ok());
    }

    #[test]
    fn test_objects_become_children() {
        let src = "\
v 0 0 0
v 1 0 0
v 0 1 0
v 0 0 1
o body
f 1 2 3
o base
f 1 3 4
f 2 3 4
";
        let root = ObjDecoder.decode(src.as_bytes()).unwrap();
        let names: Vec<_> = root.children.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["body", "base"]);
        assert_eq!(root.triangle_count(), 3);
        assert_eq!(root.children[0].primitives[0].material.name, "default");
    }

    #[test]
    fn test_negative_indices_and_normals() {
        let src = "v 0 0 0\nv 1 0 0\nv 0 1 0\nvn 0 0 1\nf -3//1 -2//1 -1//1\n";
        let root = ObjDecoder.decode(src.as_bytes()).unwrap();
        let geometry = &root.children[0].primitives[0].geometry;
        assert_eq!(geometry.normals.as_ref().unwrap(), &vec![Vec3::Z; 3]);
    }

    #[test]
    fn test_shared_vertices_deduplicated() {
        let src = "v 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\nf 1 2 3\nf 1 3 4\n";
        let root = ObjDecoder.decode(src.as_bytes()).unwrap();
        assert_eq!(root.children[0].primitives[0].geometry.vertex_count(), 4);
    }

    #[test]
    fn test_malformed_inputs() {
        let cases = [
            "v 0 0 0\nf 1 2 3\n", // index out of range
            "v a b c\n",          // bad number
            "v 0 0 0\n",          // no faces
            "",                   // empty
        ];
        for src in cases {
            let result = ObjDecoder.decode(src.as_bytes());
            assert!(
                matches!(result, Err(LoadError::Decode(_))),
                "expected decode error for {:?}",
                src
            );
        }
    }

    #[test]
    fn test_invalid_utf8() {
        let result = ObjDecoder.decode(&[0xff, 0xfe, 0x00]);
        assert!(matches!(result, Err(LoadError::Decode(_))));
    }
}
