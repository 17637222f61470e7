//! Scene registries: insertion-ordered object lists, resolved materials,
//! and the interned texture pool.
//!
//! The registry is the engine's rendition of the construction arena: all
//! of its contents are allocated while the scene is built or during the
//! sequential phase of an update, never from worker threads. A capacity
//! bound stands in for the original address window; exceeding it fails
//! construction with `AllocExhausted`.

use std::collections::HashMap;
use std::sync::Arc;

use lumen_math::{cosd, norm_angle, sind, Real};
use lumen_scene::{MaterialDesc, MaterialKind, SideDesc, TextureDesc};
use lumen_tracer::view::{props, MaterialRec};

use crate::error::{EngineError, Result};
use crate::object::NodeId;

/// Callback resolving a named texture into `(width, height, texels)`.
pub type TextureLoadFn =
    Arc<dyn Fn(&str) -> std::io::Result<(u32, u32, Vec<u32>)> + Send + Sync>;

/// Insertion-ordered registries plus the material/texture pools.
pub struct Registry {
    /// Camera nodes in insertion order.
    pub cameras: Vec<NodeId>,
    /// Light nodes in insertion order.
    pub lights: Vec<NodeId>,
    /// Surface nodes in insertion order; the tracer's surface ordinals
    /// index this list.
    pub surfaces: Vec<NodeId>,
    /// Array nodes in insertion order.
    pub arrays: Vec<NodeId>,
    /// Resolved per-side materials.
    pub materials: Vec<MaterialRec>,
    /// Shared texel pool all materials index into.
    pub texels: Vec<u32>,
    /// Texture interning table: name to `(offset, width, height)`.
    tex_index: HashMap<String, (u32, u32, u32)>,
    /// Optional loader for `TextureDesc::Load` entries.
    pub tex_loader: Option<TextureLoadFn>,
    /// Maximum number of scene nodes.
    pub max_nodes: usize,
}

impl Registry {
    /// Empty registry with the given node capacity.
    pub fn new(max_nodes: usize, tex_loader: Option<TextureLoadFn>) -> Self {
        Self {
            cameras: Vec::new(),
            lights: Vec::new(),
            surfaces: Vec::new(),
            arrays: Vec::new(),
            materials: Vec::new(),
            texels: Vec::new(),
            tex_index: HashMap::new(),
            tex_loader,
            max_nodes,
        }
    }

    /// Intern a texture, returning `(offset, width, height)`.
    fn resolve_texture(&mut self, tex: &TextureDesc) -> Result<(u32, u32, u32)> {
        match tex {
            TextureDesc::Color(val) => {
                let off = self.texels.len() as u32;
                self.texels.push(*val);
                Ok((off, 1, 1))
            }
            TextureDesc::Image {
                name,
                width,
                height,
                pixels,
            } => {
                if let Some(found) = self.tex_index.get(name) {
                    return Ok(*found);
                }
                self.intern_image(name, *width, *height, pixels)
            }
            TextureDesc::Load { name } => {
                if let Some(found) = self.tex_index.get(name) {
                    return Ok(*found);
                }
                let loader = self.tex_loader.clone().ok_or_else(|| {
                    EngineError::Io(format!("no texture loader for '{name}'"))
                })?;
                let (w, h, pixels) = loader(name).map_err(|e| EngineError::Io(e.to_string()))?;
                self.intern_image(name, w, h, &pixels)
            }
        }
    }

    fn intern_image(&mut self, name: &str, w: u32, h: u32, pixels: &[u32]) -> Result<(u32, u32, u32)> {
        if w == 0 || h == 0 || !w.is_power_of_two() || !h.is_power_of_two() {
            return Err(EngineError::MalformedScene(format!(
                "texture '{name}' dimensions {w}x{h} must be powers of two"
            )));
        }
        if pixels.len() != (w * h) as usize {
            return Err(EngineError::MalformedScene(format!(
                "texture '{name}' has {} texels, expected {}",
                pixels.len(),
                w * h
            )));
        }
        let off = self.texels.len() as u32;
        self.texels.extend_from_slice(pixels);
        self.tex_index.insert(name.to_string(), (off, w, h));
        Ok((off, w, h))
    }

    /// Resolve one surface side into a material record, returning its index.
    ///
    /// Each side gets its own record: the UV transform is part of the side,
    /// not of the shared material description.
    pub fn add_material(&mut self, side: &SideDesc) -> Result<u32> {
        let mat: &MaterialDesc = &side.mat;
        let (tex_off, tex_w, tex_h) = self.resolve_texture(&mat.tex)?;

        let mut bits = 0u32;
        if tex_w > 1 || tex_h > 1 {
            bits |= props::TEXTURE;
        }
        if mat.rfl != 0.0 {
            bits |= props::REFLECT;
        }
        if mat.rfr != 1.0 {
            bits |= props::REFRACT;
        }
        if mat.spc != 0.0 {
            bits |= props::SPECULAR;
        }
        if mat.trn == 0.0 {
            bits |= props::OPAQUE;
        }
        if mat.trn == 1.0 {
            bits |= props::TRANSP;
        }
        bits |= match mat.kind {
            MaterialKind::Light => props::LIGHT,
            _ => props::NORMAL,
        };
        if mat.kind == MaterialKind::Metal {
            bits |= props::METAL;
        }

        // the side's 2D rotation feeds texture lookup only when trivial;
        // a general angle falls back to the identity mapping
        let rot = norm_angle(side.rot);
        let (map, sgn) = uv_axis_map(rot).unwrap_or(([0, 1], [1.0, 1.0]));

        if side.scl[0] == 0.0 || side.scl[1] == 0.0 {
            return Err(EngineError::MalformedScene(
                "zero UV scale on surface side".into(),
            ));
        }

        let rec = MaterialRec {
            props: bits,
            tex_off,
            tex_w,
            tex_h,
            xmask: tex_w as i32 - 1,
            ymask: tex_h as i32 - 1,
            yshift: tex_w.trailing_zeros(),
            uv_map: map,
            xscal: tex_w as Real / side.scl[0] * sgn[0],
            yscal: tex_h as Real / side.scl[1] * sgn[1],
            xoffs: side.pos[map[0]] * tex_w as Real,
            yoffs: side.pos[map[1]] * tex_h as Real,
            dff: mat.dff,
            spc: mat.spc,
            pow: mat.pow,
            rfl: mat.rfl,
            trn: mat.trn,
            rfr: mat.rfr,
        };
        self.materials.push(rec);
        Ok(self.materials.len() as u32 - 1)
    }
}

/// Extract the signed UV permutation of a trivial 2D rotation.
fn uv_axis_map(rot: Real) -> Option<([usize; 2], [Real; 2])> {
    let (s, c) = (sind(rot), cosd(rot));
    let m = [[c, s], [-s, c]];
    let mut map = [0usize; 2];
    let mut sgn = [0.0; 2];
    let mut matched = 0;
    for i in 0..2 {
        for j in 0..2 {
            let iden = [[1.0, 0.0], [0.0, 1.0]][j];
            if m[i][0].abs() == iden[0] && m[i][1].abs() == iden[1] {
                map[i] = j;
                sgn[i] = if m[i][j] > 0.0 { 1.0 } else { -1.0 };
                matched += 1;
            }
        }
    }
    if matched == 2 {
        Some((map, sgn))
    } else {
        None
    }
}
