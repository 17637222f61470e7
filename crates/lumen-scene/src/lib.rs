#![warn(missing_docs)]

//! Scene description format for the lumen ray-tracing engine.
//!
//! A scene is described as a plain-data tree of [`ObjectDesc`] records: an
//! array at the root holding cameras, lights, surfaces, and nested arrays.
//! The engine consumes this tree at construction and never writes back into
//! it, so one description can host several engine instances in sequence.
//!
//! Every record is serde-serializable except animation hooks, which are
//! in-process closures and are skipped by serialization.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use lumen_math::{Real, Transform3d, INF};

/// Validation error for scene descriptions.
#[derive(Debug, thiserror::Error)]
pub enum SceneDescError {
    /// The root object is not an array.
    #[error("scene root must be an array")]
    RootNotArray,
    /// A relation references a child index outside the array.
    #[error("relation references child {0} of an array with {1} children")]
    RelationOutOfRange(i32, usize),
}

/// Animation hook: `(time, prev_time, transform)` mutates the engine-side
/// copy of an object's transform. Times are in milliseconds.
pub type AnimFn = Arc<dyn Fn(i64, i64, &mut Transform3d) + Send + Sync>;

/// Complete scene description: the root array.
#[derive(Clone, Serialize, Deserialize)]
pub struct SceneDesc {
    /// Root object; must be an [`Body::Array`].
    pub root: ObjectDesc,
}

impl SceneDesc {
    /// Validate structural invariants that serde cannot express:
    /// the root is an array and relation indices are in range or `-1`.
    pub fn validate(&self) -> Result<(), SceneDescError> {
        let Body::Array { children, relations } = &self.root.body else {
            return Err(SceneDescError::RootNotArray);
        };
        validate_array(children, relations)?;
        Ok(())
    }
}

fn validate_array(
    children: &[ObjectDesc],
    relations: &[Relation],
) -> Result<(), SceneDescError> {
    for rel in relations {
        for idx in [rel.obj1, rel.obj2] {
            if idx < -1 || idx >= children.len() as i32 {
                return Err(SceneDescError::RelationOutOfRange(idx, children.len()));
            }
        }
    }
    for child in children {
        if let Body::Array { children, relations } = &child.body {
            validate_array(children, relations)?;
        }
    }
    Ok(())
}

/// One object in the scene tree: a transform, a body, and an optional
/// animation hook.
#[derive(Clone, Serialize, Deserialize)]
pub struct ObjectDesc {
    /// Transform relative to the parent array.
    #[serde(default)]
    pub trm: Transform3d,
    /// Tag-dependent payload.
    pub body: Body,
    /// Animation hook, invoked when the scene time changes.
    #[serde(skip)]
    pub anim: Option<AnimFn>,
}

impl ObjectDesc {
    /// Object with the given body and an identity transform.
    pub fn new(body: Body) -> Self {
        Self {
            trm: Transform3d::identity(),
            body,
            anim: None,
        }
    }

    /// Object with the given body and transform.
    pub fn with_trm(trm: Transform3d, body: Body) -> Self {
        Self { trm, body, anim: None }
    }

    /// Attach an animation hook.
    pub fn animated(mut self, anim: AnimFn) -> Self {
        self.anim = Some(anim);
        self
    }
}

impl fmt::Debug for ObjectDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectDesc")
            .field("trm", &self.trm)
            .field("body", &self.body)
            .field("anim", &self.anim.as_ref().map(|_| "fn"))
            .finish()
    }
}

/// Tag-dependent object payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Body {
    /// Interior node: ordered children plus relations between them.
    Array {
        /// Child objects in draw order.
        children: Vec<ObjectDesc>,
        /// Relations between immediate children (clippers, bounding groups).
        #[serde(default)]
        relations: Vec<Relation>,
    },
    /// Camera.
    Camera(CameraDesc),
    /// Point light.
    Light(LightDesc),
    /// Plane `k = 0` in the local frame.
    Plane(SurfaceDesc),
    /// Cylinder `i² + j² = rad²` along the local K axis.
    Cylinder {
        /// Common surface fields.
        srf: SurfaceDesc,
        /// Cylinder radius.
        rad: Real,
    },
    /// Sphere `i² + j² + k² = rad²`.
    Sphere {
        /// Common surface fields.
        srf: SurfaceDesc,
        /// Sphere radius.
        rad: Real,
    },
    /// Cone `i² + j² = rat²·k²` along the local K axis.
    Cone {
        /// Common surface fields.
        srf: SurfaceDesc,
        /// Radius-to-height ratio.
        rat: Real,
    },
    /// Paraboloid `i² + j² = par·k`.
    Paraboloid {
        /// Common surface fields.
        srf: SurfaceDesc,
        /// Focal parameter; its sign selects the opening direction.
        par: Real,
    },
    /// Hyperboloid of one sheet `i² + j² = rat²·k² + hyp`.
    Hyperboloid {
        /// Common surface fields.
        srf: SurfaceDesc,
        /// Asymptote slope.
        rat: Real,
        /// Waist radius squared.
        hyp: Real,
    },
    /// Unsupported tag carried through deserialization; the engine skips
    /// it and adjusts the child count.
    Other(String),
}

impl Body {
    /// True for surface variants.
    pub fn is_surface(&self) -> bool {
        matches!(
            self,
            Body::Plane(_)
                | Body::Cylinder { .. }
                | Body::Sphere { .. }
                | Body::Cone { .. }
                | Body::Paraboloid { .. }
                | Body::Hyperboloid { .. }
        )
    }

    /// True for arrays.
    pub fn is_array(&self) -> bool {
        matches!(self, Body::Array { .. })
    }
}

/// Fields common to every surface variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfaceDesc {
    /// Local axis-aligned clipper box minimum; `-inf` means unbounded.
    pub cmin: [Real; 3],
    /// Local axis-aligned clipper box maximum; `+inf` means unbounded.
    pub cmax: [Real; 3],
    /// Material side facing away from the surface interior.
    pub outer: SideDesc,
    /// Material side facing the surface interior.
    pub inner: SideDesc,
}

impl SurfaceDesc {
    /// Fully unbounded surface with the same material on both sides.
    pub fn unbounded(mat: Arc<MaterialDesc>) -> Self {
        Self {
            cmin: [-INF; 3],
            cmax: [INF; 3],
            outer: SideDesc::new(mat.clone()),
            inner: SideDesc::new(mat),
        }
    }

    /// Replace the clipper box.
    pub fn clipped(mut self, cmin: [Real; 3], cmax: [Real; 3]) -> Self {
        self.cmin = cmin;
        self.cmax = cmax;
        self
    }
}

/// One side of a surface: a material plus the 2D transform applied to
/// surface-local UV coordinates before texture lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SideDesc {
    /// UV scale.
    pub scl: [Real; 2],
    /// UV rotation in degrees.
    pub rot: Real,
    /// UV offset.
    pub pos: [Real; 2],
    /// Material reference; materials are shared by `Arc`.
    pub mat: Arc<MaterialDesc>,
}

impl SideDesc {
    /// Side with an identity UV transform.
    pub fn new(mat: Arc<MaterialDesc>) -> Self {
        Self {
            scl: [1.0, 1.0],
            rot: 0.0,
            pos: [0.0, 0.0],
            mat,
        }
    }
}

/// Material classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaterialKind {
    /// Regular shaded material.
    Plain,
    /// Emissive material; rendered at full texture color, no shading.
    Light,
    /// Metal: specular highlights are tinted by the texture color.
    Metal,
}

/// Material description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialDesc {
    /// Classification tag.
    pub kind: MaterialKind,
    /// Texture.
    pub tex: TextureDesc,
    /// Diffuse coefficient.
    pub dff: Real,
    /// Specular coefficient.
    pub spc: Real,
    /// Specular power.
    pub pow: Real,
    /// Reflection coefficient in `[0, 1]`.
    pub rfl: Real,
    /// Transparency in `[0, 1]`; `0` is opaque, `1` fully transparent.
    pub trn: Real,
    /// Refraction index ratio; `1` disables refraction bending.
    pub rfr: Real,
}

impl MaterialDesc {
    /// Plain diffuse material with a solid color.
    pub fn plain(color: u32) -> Self {
        Self {
            kind: MaterialKind::Plain,
            tex: TextureDesc::Color(color),
            dff: 0.75,
            spc: 0.0,
            pow: 1.0,
            rfl: 0.0,
            trn: 0.0,
            rfr: 1.0,
        }
    }

    /// Emissive material with a solid color.
    pub fn light(color: u32) -> Self {
        Self {
            kind: MaterialKind::Light,
            ..Self::plain(color)
        }
    }

    /// Reflective metal material with a solid color.
    pub fn metal(color: u32, rfl: Real) -> Self {
        Self {
            kind: MaterialKind::Metal,
            spc: 1.0,
            pow: 32.0,
            rfl,
            ..Self::plain(color)
        }
    }
}

/// Texture description: a single color, an in-memory image, or a named
/// image resolved by the registry (interned, shared by name).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TextureDesc {
    /// Single packed XRGB color.
    Color(u32),
    /// In-memory image; dimensions must be powers of two.
    Image {
        /// Interning key.
        name: String,
        /// Width in texels, power of two.
        width: u32,
        /// Height in texels, power of two.
        height: u32,
        /// Row-major packed XRGB texels, `width * height` entries.
        pixels: Arc<Vec<u32>>,
    },
    /// Image loaded by name through the image-I/O collaborator.
    Load {
        /// File name / interning key.
        name: String,
    },
}

/// Camera description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraDesc {
    /// Global ambient color, packed XRGB.
    pub col: u32,
    /// Global ambient intensity.
    pub lum: Real,
    /// Focal distance from the eye to the image plane.
    pub pov: Real,
    /// Position delta per unit of time, for interactive movement.
    pub dps: [Real; 3],
    /// Rotation delta per unit of time, degrees.
    pub drt: [Real; 3],
}

impl Default for CameraDesc {
    fn default() -> Self {
        Self {
            col: 0x0020_2020,
            lum: 1.0,
            pov: 1.0,
            dps: [2.0, 2.0, 2.0],
            drt: [70.0, 70.0, 0.0],
        }
    }
}

/// Point light description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LightDesc {
    /// Light color, packed XRGB.
    pub col: u32,
    /// Ambient intensity added to the scene ambient term.
    pub lum_ambient: Real,
    /// Source intensity scaling the direct contribution.
    pub lum_source: Real,
    /// Attenuation `(range, constant, linear, quadratic)`.
    pub atn: [Real; 4],
}

impl Default for LightDesc {
    fn default() -> Self {
        Self {
            col: 0x00FF_FFFF,
            lum_ambient: 0.0,
            lum_source: 1.0,
            atn: [0.0, 0.0, 0.1, 0.01],
        }
    }
}

/// Relation kinds between an array's immediate children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelKind {
    /// Subtract the right surface's inner subspace from the left surface.
    MinusInner,
    /// Subtract the right surface's outer subspace from the left surface.
    MinusOuter,
    /// Close an accumulation segment opened by a `Minus*` with `obj1 == -1`.
    MinusAccum,
    /// Narrow the left/right child index space to a sub-array for the
    /// following relation.
    IndexArray,
    /// Use the right array (or this array when `obj2 == -1`) as a bounding
    /// volume for its contents.
    BoundArray,
    /// Undo a previous `BoundArray`.
    UntieArray,
    /// Attach the right child to the left (or this) array's bounding volume.
    BoundIndex,
    /// Undo a previous `BoundIndex`.
    UntieIndex,
}

/// A relation tuple `(obj1, kind, obj2)`; `-1` is the "none/this" sentinel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Relation {
    /// Left child index or `-1`.
    pub obj1: i32,
    /// Relation kind.
    pub kind: RelKind,
    /// Right child index or `-1`.
    pub obj2: i32,
}

impl Relation {
    /// Shorthand constructor.
    pub fn new(obj1: i32, kind: RelKind, obj2: i32) -> Self {
        Self { obj1, kind, obj2 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mat() -> Arc<MaterialDesc> {
        Arc::new(MaterialDesc::plain(0x00808080))
    }

    #[test]
    fn test_validate_root_must_be_array() {
        let desc = SceneDesc {
            root: ObjectDesc::new(Body::Camera(CameraDesc::default())),
        };
        assert!(matches!(desc.validate(), Err(SceneDescError::RootNotArray)));
    }

    #[test]
    fn test_validate_relation_range() {
        let desc = SceneDesc {
            root: ObjectDesc::new(Body::Array {
                children: vec![ObjectDesc::new(Body::Sphere {
                    srf: SurfaceDesc::unbounded(mat()),
                    rad: 1.0,
                })],
                relations: vec![Relation::new(0, RelKind::MinusOuter, 3)],
            }),
        };
        assert!(matches!(
            desc.validate(),
            Err(SceneDescError::RelationOutOfRange(3, 1))
        ));
    }

    #[test]
    fn test_validate_sentinel_allowed() {
        let desc = SceneDesc {
            root: ObjectDesc::new(Body::Array {
                children: vec![ObjectDesc::new(Body::Sphere {
                    srf: SurfaceDesc::unbounded(mat()),
                    rad: 1.0,
                })],
                relations: vec![Relation::new(-1, RelKind::MinusOuter, 0)],
            }),
        };
        assert!(desc.validate().is_ok());
    }

    #[test]
    fn test_json_roundtrip_drops_anim() {
        let anim: AnimFn = Arc::new(|_, _, trm: &mut Transform3d| {
            trm.pos[0] += 1.0;
        });
        let desc = SceneDesc {
            root: ObjectDesc::new(Body::Array {
                children: vec![ObjectDesc::new(Body::Plane(SurfaceDesc::unbounded(mat())))
                    .animated(anim)],
                relations: vec![],
            }),
        };
        let json = serde_json::to_string(&desc).unwrap();
        let back: SceneDesc = serde_json::from_str(&json).unwrap();
        let Body::Array { children, .. } = &back.root.body else {
            panic!("root not array");
        };
        assert!(children[0].anim.is_none());
    }
}
