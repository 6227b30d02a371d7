//! Decoded model tree

use crate::asset::geometry::Geometry;
use crate::asset::material::MaterialDesc;

/// One drawable piece of a model
#[derive(Clone, Debug, PartialEq)]
pub struct MeshPrimitive {
    pub geometry: Geometry,
    pub material: MaterialDesc,
}

/// A named node of a decoded model, owning its primitives and children
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelNode {
    pub name: String,
    pub primitives: Vec<MeshPrimitive>,
    pub children: Vec<ModelNode>,
}

impl ModelNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Visit every primitive in depth-first order
    pub fn for_each_primitive<'a>(&'a self, f: &mut impl FnMut(&'a MeshPrimitive)) {
        for primitive in &self.primitives {
            f(primitive);
        }
        for child in &self.children {
            child.for_each_primitive(f);
        }
    }

    pub fn primitive_count(&self) -> usize {
        let mut count = 0;
        self.for_each_primitive(&mut |_| count += 1);
        count
    }

    pub fn triangle_count(&self) -> usize {
        let mut count = 0;
        self.for_each_primitive(&mut |p| count += p.geometry.triangle_count());
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Vec3;

    #[test]
    fn test_counts_are_recursive() {
        let tri = MeshPrimitive {
            geometry: Geometry::new(vec![Vec3::ZERO, Vec3::X, Vec3::Y]),
            material: MaterialDesc::default(),
        };
        let mut root = ModelNode::new("root");
        root.primitives.push(tri.clone());
        let mut child = ModelNode::new("child");
        child.primitives.push(tri.clone());
        child.primitives.push(tri);
        root.children.push(child);

        assert_eq!(root.primitive_count(), 3);
        assert_eq!(root.triangle_count(), 3);
    }
}
