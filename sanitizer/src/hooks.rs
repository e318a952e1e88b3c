//! Runtime hook insertion
//!
//! Walks the rewritten module and wires it to the redzone runtime:
//!
//! - `rz_add` for every redzone of every live inflated object, immediately
//!   after the stack allocation or heap allocation site that creates it
//!   (and once at program start for globals);
//! - `rz_rm` for stack redzones before every return of the owning
//!   function;
//! - `rz_heap_free` immediately before every call to the deallocator;
//! - `rz_check` before every load and store, probing the accessed address
//!   with the byte width of the access;
//! - one `rt_probe` call in the first defined function, so a missing
//!   runtime surfaces as a link error.
//!
//! Access widths are computed with the null-pointer idiom: index a typed
//! null pointer by one and convert the result to an integer, which yields
//! the type's size without consulting a data layout.

use crate::error::TransformError;
use crate::layout::{redzone_type, StructInfo, StructMap};
use crate::rewrite::HeapSite;
use crate::REDZONE_SIZE;
use fxhash::FxHashMap;
use ir::dump::dump_instruction;
use ir::{
    GepIndex, IrBlockId, IrExternFunction, IrFunction, IrFunctionId, IrFunctionSignature, IrId,
    IrInstruction, IrModule, IrParameter, IrType, IrValue,
};
use log::debug;
use smallvec::SmallVec;
use std::rc::Rc;

/// Runtime entry points declared in the module.
pub struct RuntimeHooks {
    pub probe: IrFunctionId,
    pub add: IrFunctionId,
    pub rm: IrFunctionId,
    pub check: IrFunctionId,
    pub heap_free: IrFunctionId,
}

/// Hook insertion counters for the pass statistics.
#[derive(Debug, Default)]
pub struct HookStats {
    pub redzones_registered: usize,
    pub checks_inserted: usize,
    pub heap_frees_instrumented: usize,
}

fn declare_hook(module: &mut IrModule, name: &str, params: Vec<IrType>) -> IrFunctionId {
    if let Some(id) = module.extern_id_by_name(name) {
        return id;
    }
    let id = module.alloc_function_id();
    module.add_extern_function(IrExternFunction {
        id,
        name: name.to_string(),
        signature: IrFunctionSignature {
            parameters: params
                .into_iter()
                .enumerate()
                .map(|(i, ty)| IrParameter {
                    name: format!("a{}", i),
                    ty,
                    reg: IrId::invalid(),
                })
                .collect(),
            return_type: IrType::Void,
            varargs: false,
        },
    });
    id
}

/// Declare the redzone runtime ABI in the module.
pub fn declare_runtime(module: &mut IrModule) -> RuntimeHooks {
    let byte_ptr = IrType::U8.ptr_to();
    RuntimeHooks {
        probe: declare_hook(module, "rt_probe", vec![]),
        add: declare_hook(module, "rz_add", vec![byte_ptr.clone(), IrType::U64]),
        rm: declare_hook(module, "rz_rm", vec![byte_ptr.clone()]),
        check: declare_hook(module, "rz_check", vec![byte_ptr.clone(), IrType::U8]),
        heap_free: declare_hook(module, "rz_heap_free", vec![byte_ptr]),
    }
}

/// Index paths (relative to an object base pointer) of every redzone in a
/// type, recursing into value-nested structs and arrays.
type IndexPath = SmallVec<[GepIndex; 8]>;

fn redzone_paths(module: &IrModule, map: &StructMap, ty: &IrType) -> Vec<IndexPath> {
    let mut out = Vec::new();
    collect_paths(module, map, ty, &IndexPath::new(), &mut out);
    out
}

fn collect_paths(
    module: &IrModule,
    map: &StructMap,
    ty: &IrType,
    prefix: &IndexPath,
    out: &mut Vec<IndexPath>,
) {
    match ty {
        IrType::Array(elem, count) => {
            for e in 0..*count {
                let mut next = prefix.clone();
                next.push(GepIndex::Const(e as i64));
                collect_paths(module, map, elem, &next, out);
            }
        }
        IrType::Struct(name) => {
            let Some(info) = map.lookup_name(name) else {
                return;
            };
            if info.inflated_name != *name || info.opaque {
                return;
            }
            for &r in &info.redzone_indices {
                let mut path = prefix.clone();
                path.push(GepIndex::Const(r as i64));
                out.push(path);
            }
            let Some(def) = module.struct_def(name) else {
                return;
            };
            for (i, field) in info.fields.iter().enumerate() {
                if field.inner.is_some() {
                    let member_index = info.offset_map[i];
                    let mut next = prefix.clone();
                    next.push(GepIndex::Const(member_index as i64));
                    collect_paths(module, map, &def.members[member_index], &next, out);
                }
            }
        }
        _ => {}
    }
}

/// The inflated struct allocated by this type, if any: strips arrays and
/// requires an inflated, non-opaque struct.
fn inflated_object<'m>(map: &'m StructMap, ty: &IrType) -> Option<&'m Rc<StructInfo>> {
    let name = ty.strip_arrays().struct_name()?;
    let info = map.lookup_name(name)?;
    (info.inflated_name == name && !info.opaque).then_some(info)
}

/// Planned insertions for one block.
#[derive(Default)]
struct BlockPlan {
    before: FxHashMap<usize, Vec<IrInstruction>>,
    after: FxHashMap<usize, Vec<IrInstruction>>,
    append: Vec<IrInstruction>,
}

/// Owned result of planning one function: everything needed to splice the
/// hooks in, with no borrows held.
#[derive(Default)]
struct FunctionHookPlan {
    next_reg: u32,
    reg_types: Vec<(IrId, IrType)>,
    blocks: FxHashMap<IrBlockId, BlockPlan>,
    stats: HookStats,
}

/// Emits hook instruction sequences for one function, allocating fresh
/// registers without touching the function until the plan is applied.
struct HookPlanner<'a> {
    module: &'a IrModule,
    map: &'a StructMap,
    hooks: &'a RuntimeHooks,
    plan: FunctionHookPlan,
    stack_redzones: Vec<IrId>,
}

impl<'a> HookPlanner<'a> {
    fn new(
        module: &'a IrModule,
        map: &'a StructMap,
        hooks: &'a RuntimeHooks,
        next_reg: u32,
    ) -> Self {
        Self {
            module,
            map,
            hooks,
            plan: FunctionHookPlan {
                next_reg,
                ..FunctionHookPlan::default()
            },
            stack_redzones: Vec::new(),
        }
    }

    fn reg(&mut self, ty: IrType) -> IrId {
        let id = IrId::new(self.plan.next_reg);
        self.plan.next_reg += 1;
        self.plan.reg_types.push((id, ty));
        id
    }

    /// Registration sequence for every redzone of an object rooted at
    /// `base` (a pointer to `ty`). Returns the emitted byte-pointer
    /// registers so stack objects can be deregistered at returns.
    fn emit_adds(&mut self, base: IrId, ty: &IrType, count: u64, seq: &mut Vec<IrInstruction>) -> Vec<IrId> {
        let paths = redzone_paths(self.module, self.map, ty);
        let mut ptrs = Vec::with_capacity(paths.len() * count as usize);
        for e in 0..count {
            for path in &paths {
                let mut indices = Vec::with_capacity(path.len() + 1);
                indices.push(GepIndex::Const(e as i64));
                indices.extend(path.iter().copied());

                let zone = self.reg(redzone_type().ptr_to());
                seq.push(IrInstruction::GetElementPtr {
                    dest: zone,
                    ptr: base,
                    source_ty: ty.clone(),
                    indices,
                });
                let zone_bytes = self.reg(IrType::U8.ptr_to());
                seq.push(IrInstruction::BitCast {
                    dest: zone_bytes,
                    src: zone,
                    to_ty: IrType::U8.ptr_to(),
                });
                let size = self.reg(IrType::U64);
                seq.push(IrInstruction::Const {
                    dest: size,
                    value: IrValue::U64(REDZONE_SIZE),
                });
                seq.push(IrInstruction::CallDirect {
                    dest: None,
                    func_id: self.hooks.add,
                    args: vec![zone_bytes, size],
                });
                ptrs.push(zone_bytes);
                self.plan.stats.redzones_registered += 1;
            }
        }
        ptrs
    }

    /// Access check sequence before a load or store of `accessed_ty`
    /// through `ptr`.
    fn emit_check(&mut self, ptr: IrId, accessed_ty: &IrType) -> Vec<IrInstruction> {
        let mut seq = Vec::with_capacity(5);

        let probe = self.reg(IrType::U8.ptr_to());
        seq.push(IrInstruction::BitCast {
            dest: probe,
            src: ptr,
            to_ty: IrType::U8.ptr_to(),
        });

        // Typed null pointer indexed by one, converted to an integer: the
        // width of the access without consulting a data layout.
        let null = self.reg(accessed_ty.clone().ptr_to());
        seq.push(IrInstruction::Const {
            dest: null,
            value: IrValue::Null,
        });
        let size_ptr = self.reg(accessed_ty.clone().ptr_to());
        seq.push(IrInstruction::GetElementPtr {
            dest: size_ptr,
            ptr: null,
            source_ty: accessed_ty.clone(),
            indices: vec![GepIndex::Const(1)],
        });
        let width = self.reg(IrType::U8);
        seq.push(IrInstruction::Cast {
            dest: width,
            src: size_ptr,
            from_ty: accessed_ty.clone().ptr_to(),
            to_ty: IrType::U8,
        });

        seq.push(IrInstruction::CallDirect {
            dest: None,
            func_id: self.hooks.check,
            args: vec![probe, width],
        });
        self.plan.stats.checks_inserted += 1;
        seq
    }

    fn block(&mut self, id: IrBlockId) -> &mut BlockPlan {
        self.plan.blocks.entry(id).or_default()
    }

    fn finish(self) -> FunctionHookPlan {
        self.plan
    }
}

/// Instrument every defined function and register global redzones.
pub fn insert_hooks(
    module: &mut IrModule,
    map: &StructMap,
    heap_sites: &FxHashMap<IrFunctionId, Vec<HeapSite>>,
    hooks: &RuntimeHooks,
) -> Result<HookStats, TransformError> {
    let mut stats = HookStats::default();
    let free_id = module.extern_id_by_name("free");

    let function_ids = module.sorted_function_ids();
    for &fid in &function_ids {
        let func = &module.functions[&fid];
        if !func.has_body() {
            continue;
        }
        let sites = heap_sites.get(&fid).map(Vec::as_slice).unwrap_or(&[]);
        let plan = plan_function(module, map, hooks, func, sites, free_id)?;
        stats.redzones_registered += plan.stats.redzones_registered;
        stats.checks_inserted += plan.stats.checks_inserted;
        stats.heap_frees_instrumented += plan.stats.heap_frees_instrumented;
        apply_plan(module.functions.get_mut(&fid).unwrap(), plan);
    }

    // The link-sanity probe goes into the first defined function; global
    // redzones are registered at program entry (main's shell if present,
    // otherwise the same first function).
    let first = function_ids
        .iter()
        .copied()
        .find(|fid| module.functions[fid].has_body());
    if let Some(first) = first {
        let probe_call = IrInstruction::CallDirect {
            dest: None,
            func_id: hooks.probe,
            args: vec![],
        };
        let entry = module.functions[&first].cfg.entry_block;
        let block = module
            .functions
            .get_mut(&first)
            .unwrap()
            .cfg
            .get_block_mut(entry)
            .unwrap();
        block.instructions.insert(0, probe_call);

        let target = module
            .function_id_by_name("main")
            .filter(|fid| module.functions[fid].has_body())
            .unwrap_or(first);
        register_global_redzones(module, map, hooks, target, &mut stats);
    }

    debug!(
        "hooks inserted: {} redzones, {} checks, {} frees",
        stats.redzones_registered, stats.checks_inserted, stats.heap_frees_instrumented
    );
    Ok(stats)
}

fn plan_function(
    module: &IrModule,
    map: &StructMap,
    hooks: &RuntimeHooks,
    func: &IrFunction,
    heap_sites: &[HeapSite],
    free_id: Option<IrFunctionId>,
) -> Result<FunctionHookPlan, TransformError> {
    let mut planner = HookPlanner::new(module, map, hooks, func.next_reg_id);

    // Constant definitions, for stack array counts
    let mut const_defs: FxHashMap<IrId, IrValue> = FxHashMap::default();
    // Definition sites, for locating heap-site bitcasts
    let mut def_sites: FxHashMap<IrId, (IrBlockId, usize)> = FxHashMap::default();
    for block_id in func.cfg.sorted_block_ids() {
        let block = &func.cfg.blocks[&block_id];
        for (i, inst) in block.instructions.iter().enumerate() {
            if let IrInstruction::Const { dest, value } = inst {
                const_defs.insert(*dest, value.clone());
            }
            if let Some(dest) = inst.dest() {
                def_sites.insert(dest, (block_id, i));
            }
        }
    }

    for block_id in func.cfg.sorted_block_ids() {
        let block = &func.cfg.blocks[&block_id];
        for (i, inst) in block.instructions.iter().enumerate() {
            match inst {
                // Live stack aggregate: register every redzone right after
                // the allocation
                IrInstruction::Alloca { dest, ty, count } => {
                    if inflated_object(map, ty).is_none() {
                        continue;
                    }
                    let elements = match count {
                        None => 1,
                        Some(reg) => const_defs
                            .get(reg)
                            .and_then(IrValue::as_uint)
                            .ok_or_else(|| TransformError::NonConstantAllocaCount {
                                instruction: dump_instruction(inst),
                            })?,
                    };
                    let mut seq = Vec::new();
                    let ptrs = planner.emit_adds(*dest, ty, elements, &mut seq);
                    planner.stack_redzones.extend(ptrs);
                    planner
                        .block(block_id)
                        .after
                        .entry(i)
                        .or_default()
                        .extend(seq);
                }

                // Deallocation: drop the block's redzones first
                IrInstruction::CallDirect { func_id, args, .. }
                    if Some(*func_id) == free_id && !args.is_empty() =>
                {
                    let seq = vec![IrInstruction::CallDirect {
                        dest: None,
                        func_id: hooks.heap_free,
                        args: vec![args[0]],
                    }];
                    planner.plan.stats.heap_frees_instrumented += 1;
                    planner
                        .block(block_id)
                        .before
                        .entry(i)
                        .or_default()
                        .extend(seq);
                }

                IrInstruction::Load { ptr, ty, .. } => {
                    let seq = planner.emit_check(*ptr, ty);
                    planner
                        .block(block_id)
                        .before
                        .entry(i)
                        .or_default()
                        .extend(seq);
                }

                IrInstruction::Store { ptr, value } => {
                    let value_ty = func
                        .register_types
                        .get(value)
                        .ok_or_else(|| TransformError::MalformedModule {
                            detail: format!(
                                "store of untyped register at: {}",
                                dump_instruction(inst)
                            ),
                        })?
                        .clone();
                    let seq = planner.emit_check(*ptr, &value_ty);
                    planner
                        .block(block_id)
                        .before
                        .entry(i)
                        .or_default()
                        .extend(seq);
                }

                _ => {}
            }
        }
    }

    // Heap allocation sites: register per-element redzones right after the
    // typing bitcast
    for site in heap_sites {
        let Some(&(block_id, index)) = def_sites.get(&site.ptr) else {
            continue;
        };
        let ty = IrType::Struct(site.info.inflated_name.clone());
        let mut seq = Vec::new();
        planner.emit_adds(site.ptr, &ty, site.count, &mut seq);
        planner
            .block(block_id)
            .after
            .entry(index)
            .or_default()
            .extend(seq);
    }

    // Stack redzones are live until the function returns
    if !planner.stack_redzones.is_empty() {
        for block_id in func.cfg.return_blocks() {
            let rm = planner.hooks.rm;
            let calls: Vec<IrInstruction> = planner
                .stack_redzones
                .iter()
                .map(|&ptr| IrInstruction::CallDirect {
                    dest: None,
                    func_id: rm,
                    args: vec![ptr],
                })
                .collect();
            planner.block(block_id).append.extend(calls);
        }
    }

    Ok(planner.finish())
}

fn apply_plan(func: &mut IrFunction, plan: FunctionHookPlan) {
    let FunctionHookPlan {
        next_reg,
        reg_types,
        mut blocks,
        ..
    } = plan;

    for block_id in func.cfg.sorted_block_ids() {
        let Some(mut block_plan) = blocks.remove(&block_id) else {
            continue;
        };
        let block = func.cfg.get_block_mut(block_id).unwrap();
        let old = std::mem::take(&mut block.instructions);
        let mut new = Vec::with_capacity(old.len() + 8);
        for (i, inst) in old.into_iter().enumerate() {
            if let Some(mut seq) = block_plan.before.remove(&i) {
                new.append(&mut seq);
            }
            new.push(inst);
            if let Some(mut seq) = block_plan.after.remove(&i) {
                new.append(&mut seq);
            }
        }
        new.append(&mut block_plan.append);
        block.instructions = new;
    }

    func.next_reg_id = next_reg;
    func.register_types.extend(reg_types);
}

/// Register the redzones of module globals at program entry.
fn register_global_redzones(
    module: &mut IrModule,
    map: &StructMap,
    hooks: &RuntimeHooks,
    target: IrFunctionId,
    stats: &mut HookStats,
) {
    let mut global_ids: Vec<_> = module.globals.keys().copied().collect();
    global_ids.sort();

    let next_reg_id = module.functions[&target].next_reg_id;
    let mut planner = HookPlanner::new(module, map, hooks, next_reg_id);

    let mut seq = Vec::new();
    for gid in global_ids {
        let global = &module.globals[&gid];
        if inflated_object(map, &global.ty).is_none() {
            continue;
        }
        let ty = global.ty.clone();
        let base = planner.reg(ty.clone().ptr_to());
        seq.push(IrInstruction::GlobalAddr {
            dest: base,
            global_id: gid,
        });
        planner.emit_adds(base, &ty, 1, &mut seq);
    }

    let FunctionHookPlan {
        next_reg,
        reg_types,
        stats: plan_stats,
        ..
    } = planner.finish();
    stats.redzones_registered += plan_stats.redzones_registered;

    if seq.is_empty() {
        return;
    }
    let func = module.functions.get_mut(&target).unwrap();
    let entry = func.cfg.entry_block;
    let block = func.cfg.get_block_mut(entry).unwrap();
    let mut rest = std::mem::take(&mut block.instructions);
    let mut new = seq;
    new.append(&mut rest);
    block.instructions = new;
    func.next_reg_id = next_reg;
    func.register_types.extend(reg_types);
}
