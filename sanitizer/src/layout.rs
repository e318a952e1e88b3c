//! Struct layout model
//!
//! For every identified struct in the module this builds a parallel
//! "inflated" struct type with a one-byte redzone before the first member
//! and after every member, plus the bookkeeping needed to rewrite member
//! accesses: the original→inflated member index mapping and the set of
//! redzone member indices.
//!
//! Construction runs in two passes so self-referential and mutually
//! referential structs resolve:
//!
//! 1. **Shallow pass.** Interns `<name>.inflated` for every struct,
//!    following value nesting (members that are structs or arrays of
//!    structs) but *not* pointers. Pointer members keep their original
//!    pointee, which breaks recursion for self-referential types.
//! 2. **Deep pass.** Rebuilds every inflated body, this time renaming
//!    struct references behind pointer layers (and inside function types)
//!    to their inflated counterparts. By now every inflated name exists,
//!    so the rename is a pure name lookup.

use crate::error::TransformError;
use crate::{inflated_name, is_inflated_name, REDZONE_SIZE};
use indexmap::IndexMap;
use ir::{IrModule, IrType};
use log::{debug, trace};
use std::rc::Rc;

/// Metadata for one member of an original struct.
#[derive(Debug)]
pub struct FieldInfo {
    /// The original member type
    pub ty: IrType,

    /// Layout record of the struct this member holds *by value* (directly
    /// or through arrays). `None` for scalars, pointers, and function
    /// pointers; structs reached only through a pointer are resolved by
    /// name against the [`StructMap`] instead, which is what allows
    /// self-referential types.
    pub inner: Option<Rc<StructInfo>>,

    /// Allocation size in bytes in the original layout; zero if unsized
    pub size: u64,
}

/// Layout record shared by an original struct and its inflated twin.
#[derive(Debug)]
pub struct StructInfo {
    /// Name of the original struct type
    pub original_name: String,

    /// Name of the inflated struct type
    pub inflated_name: String,

    /// Members of the original struct, in declaration order
    pub fields: Vec<FieldInfo>,

    /// Allocation size of the original layout (zero if opaque)
    pub original_size: u64,

    /// Allocation size of the inflated layout (zero if opaque)
    pub inflated_size: u64,

    /// Original member index → inflated member index (always `i → 2i + 1`)
    pub offset_map: Vec<usize>,

    /// Inflated member indices that are redzones (`0, 2, …, 2N`)
    pub redzone_indices: Vec<usize>,

    /// Whether the original struct is a forward declaration with no body
    pub opaque: bool,
}

impl StructInfo {
    /// Inflated member index of original member `i`
    pub fn inflated_index(&self, i: usize) -> usize {
        self.offset_map[i]
    }
}

/// The type of one redzone member: a byte array of the redzone size.
pub fn redzone_type() -> IrType {
    IrType::U8.array_of(REDZONE_SIZE as usize)
}

/// Map from struct type to layout record, keyed by *both* the original and
/// the inflated name so any struct reference met during rewriting resolves.
pub struct StructMap {
    infos: IndexMap<String, Rc<StructInfo>>,
}

impl StructMap {
    /// Build layout records for every identified struct in the module and
    /// intern the inflated types in the module type table.
    pub fn build(module: &mut IrModule) -> Result<Self, TransformError> {
        // The inflated namespace must be free
        for name in module.identified_structs() {
            if is_inflated_name(name) {
                return Err(TransformError::ReservedName { name: name.into() });
            }
        }
        for func in module.functions.values() {
            if is_inflated_name(&func.name) {
                return Err(TransformError::ReservedName {
                    name: func.name.clone(),
                });
            }
        }
        for ext in module.extern_functions.values() {
            if is_inflated_name(&ext.name) {
                return Err(TransformError::ReservedName {
                    name: ext.name.clone(),
                });
            }
        }

        let original_names: Vec<String> = module.identified_structs().map(String::from).collect();

        for name in &original_names {
            shallow_walk(module, name);
        }

        for name in &original_names {
            deep_rewire(module, name);
        }

        let mut map = StructMap {
            infos: IndexMap::new(),
        };
        for name in &original_names {
            map.build_info(module, name)?;
        }

        debug!("struct layout built for {} types", original_names.len());
        Ok(map)
    }

    /// Layout record for a struct name (original or inflated)
    pub fn lookup_name(&self, name: &str) -> Option<&Rc<StructInfo>> {
        self.infos.get(name)
    }

    /// Layout record for a struct type reference
    pub fn lookup(&self, ty: &IrType) -> Option<&Rc<StructInfo>> {
        self.lookup_name(ty.struct_name()?)
    }

    /// Whether this type names an *inflated* struct
    pub fn is_inflated_struct(&self, ty: &IrType) -> bool {
        match ty.struct_name() {
            Some(name) => self
                .lookup_name(name)
                .map(|info| info.inflated_name == name)
                .unwrap_or(false),
            None => false,
        }
    }

    /// Layout records of the original structs, in deterministic order
    pub fn originals(&self) -> impl Iterator<Item = &Rc<StructInfo>> {
        self.infos
            .iter()
            .filter(|(name, info)| name.as_str() == info.original_name)
            .map(|(_, info)| info)
    }

    /// Number of original structs mapped
    pub fn original_count(&self) -> usize {
        self.originals().count()
    }

    fn build_info(&mut self, module: &IrModule, name: &str) -> Result<Rc<StructInfo>, TransformError> {
        if let Some(info) = self.infos.get(name) {
            return Ok(info.clone());
        }

        let def = module
            .struct_def(name)
            .ok_or_else(|| TransformError::UnknownStruct {
                ty: format!("%{}", name),
                context: "struct layout construction".into(),
            })?
            .clone();
        let inflated = inflated_name(name);

        let info = if def.opaque {
            StructInfo {
                original_name: name.to_string(),
                inflated_name: inflated.clone(),
                fields: Vec::new(),
                original_size: 0,
                inflated_size: 0,
                offset_map: Vec::new(),
                redzone_indices: Vec::new(),
                opaque: true,
            }
        } else {
            let mut fields = Vec::with_capacity(def.members.len());
            for member in &def.members {
                let inner = match member.strip_arrays() {
                    IrType::Struct(inner_name) => {
                        Some(self.build_info(module, inner_name)?)
                    }
                    _ => None,
                };
                fields.push(FieldInfo {
                    ty: member.clone(),
                    inner,
                    size: module.alloc_size(member).unwrap_or(0),
                });
            }
            let n = fields.len();
            StructInfo {
                original_name: name.to_string(),
                inflated_name: inflated.clone(),
                fields,
                original_size: module.alloc_size(&IrType::Struct(name.into())).unwrap_or(0),
                inflated_size: module
                    .alloc_size(&IrType::Struct(inflated.clone()))
                    .unwrap_or(0),
                offset_map: (0..n).map(|i| 2 * i + 1).collect(),
                redzone_indices: (0..=n).map(|i| 2 * i).collect(),
                opaque: false,
            }
        };

        trace!(
            "layout %{}: {} members, {} -> {} bytes",
            name,
            info.fields.len(),
            info.original_size,
            info.inflated_size
        );

        let rc = Rc::new(info);
        self.infos.insert(name.to_string(), rc.clone());
        self.infos.insert(inflated, rc.clone());
        Ok(rc)
    }
}

/// Shallow pass: intern `<name>.inflated`, following value nesting only.
fn shallow_walk(module: &mut IrModule, name: &str) {
    let inflated = inflated_name(name);
    if module.has_struct(&inflated) {
        // Interned by an earlier walk
        return;
    }
    let def = match module.struct_def(name) {
        Some(def) => def.clone(),
        None => return,
    };
    if def.opaque {
        module.declare_opaque_struct(inflated);
        return;
    }

    let mut members = Vec::with_capacity(def.members.len() * 2 + 1);
    // A redzone before the first member catches underflows
    members.push(redzone_type());
    for member in &def.members {
        members.push(shallow_member(module, member));
        members.push(redzone_type());
    }
    module.define_struct(inflated, members);
}

fn shallow_member(module: &mut IrModule, ty: &IrType) -> IrType {
    match ty {
        IrType::Array(elem, n) => IrType::Array(Box::new(shallow_member(module, elem)), *n),
        IrType::Struct(inner) => {
            shallow_walk(module, inner);
            IrType::Struct(inflated_name(inner))
        }
        other => other.clone(),
    }
}

/// Deep pass: rebuild the inflated body with struct references behind
/// pointers renamed to their inflated twins.
fn deep_rewire(module: &mut IrModule, name: &str) {
    let def = match module.struct_def(name) {
        Some(def) => def.clone(),
        None => return,
    };
    if def.opaque {
        return;
    }

    let mut members = Vec::with_capacity(def.members.len() * 2 + 1);
    members.push(redzone_type());
    for member in &def.members {
        members.push(deep_member(member));
        members.push(redzone_type());
    }
    module.set_struct_body(&inflated_name(name), members);
}

fn deep_member(ty: &IrType) -> IrType {
    match ty {
        IrType::Ptr(inner) => deep_member(inner).ptr_to(),
        IrType::Array(elem, n) => IrType::Array(Box::new(deep_member(elem)), *n),
        IrType::Struct(name) if !is_inflated_name(name) => IrType::Struct(inflated_name(name)),
        IrType::Function {
            params,
            return_type,
            varargs,
        } => IrType::Function {
            params: params.iter().map(deep_member).collect(),
            return_type: Box::new(deep_member(return_type)),
            varargs: *varargs,
        },
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ir::ModuleBuilder;

    fn simple_module() -> IrModule {
        let mut b = ModuleBuilder::new("test");
        b.define_struct(
            "simple",
            vec![
                IrType::I32,
                IrType::I8.array_of(2),
                IrType::I8.array_of(3),
                IrType::I8,
            ],
        );
        b.finish()
    }

    #[test]
    fn test_inflation_totality() {
        let mut module = simple_module();
        let map = StructMap::build(&mut module).unwrap();

        let info = map.lookup_name("simple").unwrap();
        assert!(Rc::ptr_eq(info, map.lookup_name("simple.inflated").unwrap()));

        // 2N + 1 members, redzones at even indices, originals at odd
        let inflated = module.struct_def("simple.inflated").unwrap();
        assert_eq!(inflated.members.len(), 2 * 4 + 1);
        for i in 0..4 {
            assert_eq!(inflated.members[2 * i + 1], info.fields[i].ty);
        }
        for &r in &info.redzone_indices {
            assert_eq!(inflated.members[r], redzone_type());
        }
        assert_eq!(info.redzone_indices, vec![0, 2, 4, 6, 8]);
    }

    #[test]
    fn test_offset_map_round_trip() {
        let mut module = simple_module();
        let map = StructMap::build(&mut module).unwrap();
        let info = map.lookup_name("simple").unwrap();

        assert_eq!(info.offset_map, vec![1, 3, 5, 7]);
        let inflated = module.struct_def("simple.inflated").unwrap();
        for (i, field) in info.fields.iter().enumerate() {
            assert_eq!(inflated.members[info.inflated_index(i)], field.ty);
        }
    }

    #[test]
    fn test_sizes() {
        let mut module = simple_module();
        let map = StructMap::build(&mut module).unwrap();
        let info = map.lookup_name("simple").unwrap();

        // 4 + 2 + 3 + 1 member bytes, 5 redzone bytes
        assert_eq!(info.original_size, 10);
        assert_eq!(info.inflated_size, 10 + 5 * REDZONE_SIZE);
        assert_eq!(info.fields[1].size, 2);
    }

    #[test]
    fn test_nested_struct_uses_inflated_member() {
        let mut b = ModuleBuilder::new("test");
        b.define_struct("inner", vec![IrType::I32, IrType::I8.array_of(2)]);
        b.define_struct(
            "outer",
            vec![IrType::I32, IrType::Struct("inner".into())],
        );
        let mut module = b.finish();
        let map = StructMap::build(&mut module).unwrap();

        let outer = module.struct_def("outer.inflated").unwrap();
        assert_eq!(outer.members[3], IrType::Struct("inner.inflated".into()));

        let info = map.lookup_name("outer").unwrap();
        assert!(info.fields[1].inner.is_some());
        assert_eq!(
            info.fields[1].inner.as_ref().unwrap().original_name,
            "inner"
        );
        // Inflated size accounts for the inflated nested member
        let inner = map.lookup_name("inner").unwrap();
        assert_eq!(
            info.inflated_size,
            4 + inner.inflated_size + 3 * REDZONE_SIZE
        );
    }

    #[test]
    fn test_array_of_struct_member() {
        let mut b = ModuleBuilder::new("test");
        b.define_struct("elem", vec![IrType::I16]);
        b.define_struct(
            "holder",
            vec![IrType::Struct("elem".into()).array_of(3)],
        );
        let mut module = b.finish();
        let map = StructMap::build(&mut module).unwrap();

        let holder = module.struct_def("holder.inflated").unwrap();
        assert_eq!(
            holder.members[1],
            IrType::Struct("elem.inflated".into()).array_of(3)
        );
        assert!(map.lookup_name("holder").unwrap().fields[0].inner.is_some());
    }

    #[test]
    fn test_self_referential_struct() {
        let mut b = ModuleBuilder::new("test");
        b.define_struct(
            "node",
            vec![IrType::I64, IrType::Struct("node".into()).ptr_to()],
        );
        let mut module = b.finish();
        let map = StructMap::build(&mut module).unwrap();

        let node = module.struct_def("node.inflated").unwrap();
        // Pointer member rewired to the inflated twin by the deep pass
        assert_eq!(
            node.members[3],
            IrType::Struct("node.inflated".into()).ptr_to()
        );
        // Pointer nesting does not produce an owning inner link
        let info = map.lookup_name("node").unwrap();
        assert!(info.fields[1].inner.is_none());
        assert_eq!(info.fields[1].size, 8);
    }

    #[test]
    fn test_opaque_struct() {
        let mut b = ModuleBuilder::new("test");
        b.declare_opaque_struct("fwd");
        b.define_struct("user", vec![IrType::Struct("fwd".into()).ptr_to()]);
        let mut module = b.finish();
        let map = StructMap::build(&mut module).unwrap();

        let info = map.lookup_name("fwd").unwrap();
        assert!(info.opaque);
        assert!(info.fields.is_empty());
        assert!(info.redzone_indices.is_empty());
        assert!(module.struct_def("fwd.inflated").unwrap().opaque);

        // Pointer-to-opaque is still rewired by name
        let user = module.struct_def("user.inflated").unwrap();
        assert_eq!(
            user.members[1],
            IrType::Struct("fwd.inflated".into()).ptr_to()
        );
    }

    #[test]
    fn test_reserved_name_rejected() {
        let mut b = ModuleBuilder::new("test");
        b.define_struct("sneaky.inflated", vec![IrType::I32]);
        let mut module = b.finish();
        assert!(matches!(
            StructMap::build(&mut module),
            Err(TransformError::ReservedName { .. })
        ));
    }
}
