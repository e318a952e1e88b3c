//! Type inflation
//!
//! The pure mapping from any type to its inflated counterpart: struct
//! references are renamed to their inflated twins, pointer layers and array
//! sizes are preserved, and function types are rebuilt member-wise (needed
//! for function-pointer parameters). The `changed` flag reports whether the
//! type mentions a struct at all, which is what the signature transformer
//! uses to skip functions with no struct traffic.

use crate::error::TransformError;
use crate::layout::StructMap;
use ir::IrType;

/// Return the inflated counterpart of `ty` and whether anything changed.
///
/// Already-inflated struct references pass through unchanged, so the
/// mapping is idempotent. Opaque pointers are rejected: the transformation
/// requires typed-pointer IR.
pub fn inflated_type(map: &StructMap, ty: &IrType) -> Result<(IrType, bool), TransformError> {
    // Strip pointer layers, counting them
    let mut pointer_layers = 0usize;
    let mut residual = ty;
    while let IrType::Ptr(inner) = residual {
        pointer_layers += 1;
        residual = inner;
    }

    let (mut rebuilt, changed) = match residual {
        IrType::OpaquePtr => {
            return Err(TransformError::OpaquePointer {
                context: ty.to_string(),
            })
        }
        IrType::Struct(name) => {
            let info = map
                .lookup_name(name)
                .ok_or_else(|| TransformError::UnknownStruct {
                    ty: format!("%{}", name),
                    context: "type inflation".into(),
                })?;
            if *name == info.inflated_name {
                (residual.clone(), false)
            } else {
                (IrType::Struct(info.inflated_name.clone()), true)
            }
        }
        IrType::Array(elem, count) => {
            let (elem, changed) = inflated_type(map, elem)?;
            (IrType::Array(Box::new(elem), *count), changed)
        }
        IrType::Function {
            params,
            return_type,
            varargs,
        } => {
            let mut changed = false;
            let mut new_params = Vec::with_capacity(params.len());
            for param in params {
                let (param, param_changed) = inflated_type(map, param)?;
                changed |= param_changed;
                new_params.push(param);
            }
            let (ret, ret_changed) = inflated_type(map, return_type)?;
            changed |= ret_changed;
            (
                IrType::Function {
                    params: new_params,
                    return_type: Box::new(ret),
                    varargs: *varargs,
                },
                changed,
            )
        }
        other => (other.clone(), false),
    };

    // Re-apply the counted pointer layers
    for _ in 0..pointer_layers {
        rebuilt = rebuilt.ptr_to();
    }
    Ok((rebuilt, changed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::StructMap;
    use ir::ModuleBuilder;

    fn map_with_simple() -> StructMap {
        let mut b = ModuleBuilder::new("test");
        b.define_struct("simple", vec![IrType::I32, IrType::I8.array_of(2)]);
        let mut module = b.finish();
        StructMap::build(&mut module).unwrap()
    }

    #[test]
    fn test_scalars_unchanged() {
        let map = map_with_simple();
        let (ty, changed) = inflated_type(&map, &IrType::I64).unwrap();
        assert_eq!(ty, IrType::I64);
        assert!(!changed);
    }

    #[test]
    fn test_pointer_layers_preserved() {
        let map = map_with_simple();
        let deep = IrType::Struct("simple".into()).ptr_to().ptr_to().ptr_to();
        let (ty, changed) = inflated_type(&map, &deep).unwrap();
        assert!(changed);
        assert_eq!(
            ty,
            IrType::Struct("simple.inflated".into())
                .ptr_to()
                .ptr_to()
                .ptr_to()
        );
    }

    #[test]
    fn test_array_sizes_preserved() {
        let map = map_with_simple();
        let arr = IrType::Struct("simple".into()).array_of(7).ptr_to();
        let (ty, changed) = inflated_type(&map, &arr).unwrap();
        assert!(changed);
        assert_eq!(
            ty,
            IrType::Struct("simple.inflated".into()).array_of(7).ptr_to()
        );
    }

    #[test]
    fn test_function_type_rebuilt() {
        let map = map_with_simple();
        let fn_ty = IrType::Function {
            params: vec![IrType::Struct("simple".into()).ptr_to(), IrType::I32],
            return_type: Box::new(IrType::Struct("simple".into()).ptr_to()),
            varargs: false,
        };
        let (ty, changed) = inflated_type(&map, &fn_ty.clone().ptr_to()).unwrap();
        assert!(changed);
        assert_eq!(
            ty,
            IrType::Function {
                params: vec![
                    IrType::Struct("simple.inflated".into()).ptr_to(),
                    IrType::I32
                ],
                return_type: Box::new(IrType::Struct("simple.inflated".into()).ptr_to()),
                varargs: false,
            }
            .ptr_to()
        );
    }

    #[test]
    fn test_idempotent() {
        let map = map_with_simple();
        let ty = IrType::Struct("simple.inflated".into()).ptr_to();
        let (same, changed) = inflated_type(&map, &ty).unwrap();
        assert_eq!(same, ty);
        assert!(!changed);
    }

    #[test]
    fn test_opaque_pointer_rejected() {
        let map = map_with_simple();
        assert!(matches!(
            inflated_type(&map, &IrType::OpaquePtr),
            Err(TransformError::OpaquePointer { .. })
        ));
        assert!(matches!(
            inflated_type(&map, &IrType::OpaquePtr.ptr_to()),
            Err(TransformError::OpaquePointer { .. })
        ));
    }

    #[test]
    fn test_unknown_struct_rejected() {
        let map = map_with_simple();
        assert!(matches!(
            inflated_type(&map, &IrType::Struct("mystery".into())),
            Err(TransformError::UnknownStruct { .. })
        ));
    }
}
