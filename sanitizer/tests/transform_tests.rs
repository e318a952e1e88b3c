//! Whole-pass transformation tests
//!
//! Each test builds a small program the way a C frontend would emit it,
//! runs the full sanitizer pass, and checks the shape of the instrumented
//! module: inflated layouts, remapped member accesses, scaled heap sizes,
//! and the placement of runtime hook calls.

use ir::{
    GepIndex, IrFunction, IrFunctionId, IrInstruction, IrModule, IrType, IrValue, ModuleBuilder,
    PassRegistry,
};
use sanitizer::{register_passes, StructZoneSanitizer, REDZONE_SIZE};

/// `struct simple { int zero; char one[2]; char two[3]; char three; }`
fn define_simple(b: &mut ModuleBuilder) -> IrType {
    b.define_struct(
        "simple",
        vec![
            IrType::I32,
            IrType::I8.array_of(2),
            IrType::I8.array_of(3),
            IrType::I8,
        ],
    )
}

fn run_pass(module: &mut IrModule) {
    StructZoneSanitizer::new().run(module).unwrap();
}

fn extern_id(module: &IrModule, name: &str) -> IrFunctionId {
    module
        .extern_id_by_name(name)
        .unwrap_or_else(|| panic!("extern {} not declared", name))
}

fn calls_to(func: &IrFunction, callee: IrFunctionId) -> usize {
    func.cfg
        .blocks
        .values()
        .flat_map(|block| block.instructions.iter())
        .filter(|inst| matches!(inst, IrInstruction::CallDirect { func_id, .. } if *func_id == callee))
        .count()
}

fn instructions_of(func: &IrFunction) -> Vec<&IrInstruction> {
    let mut out = Vec::new();
    for block_id in func.cfg.sorted_block_ids() {
        out.extend(func.cfg.blocks[&block_id].instructions.iter());
    }
    out
}

/// Stack program over `simple`: stores to every member, one load back.
fn stack_program() -> (IrModule, IrFunctionId) {
    let mut b = ModuleBuilder::new("stack");
    let simple = define_simple(&mut b);
    let main = b.begin_function("main").returns(IrType::I32).build();
    b.set_current_function(main);
    let entry = b.create_block("entry");
    b.set_insert_point(entry);

    let e = b.alloca(simple.clone());
    let seven = b.const_i32(7);
    let zero_ptr = b.gep(
        e,
        simple.clone(),
        vec![GepIndex::Const(0), GepIndex::Const(0)],
    );
    b.store(zero_ptr, seven);

    for (member, idx) in [(1i64, 0i64), (1, 1), (2, 0), (2, 1), (2, 2)] {
        let byte = b.const_val(IrValue::I8(member as i8), IrType::I8);
        let ptr = b.gep(
            e,
            simple.clone(),
            vec![
                GepIndex::Const(0),
                GepIndex::Const(member),
                GepIndex::Const(idx),
            ],
        );
        b.store(ptr, byte);
    }

    let loaded = b.load(zero_ptr, IrType::I32);
    b.ret(Some(loaded));
    (b.finish(), main)
}

#[test]
fn simple_struct_is_inflated_and_instrumented() {
    let (mut module, main) = stack_program();
    run_pass(&mut module);

    // Inflation totality: 2N+1 members, redzones on even indices
    let inflated = module.struct_def("simple.inflated").unwrap();
    assert_eq!(inflated.members.len(), 9);
    for i in 0..4 {
        assert_eq!(inflated.members[2 * i], IrType::U8.array_of(1));
    }
    assert_eq!(
        module.alloc_size(&IrType::Struct("simple.inflated".into())),
        Some(10 + 5 * REDZONE_SIZE)
    );

    let func = &module.functions[&main];
    let insts = instructions_of(func);

    // The allocation moved to the inflated layout
    assert!(insts.iter().any(|inst| matches!(
        inst,
        IrInstruction::Alloca { ty: IrType::Struct(name), .. } if name == "simple.inflated"
    )));
    // No original-layout allocation remains
    assert!(!insts.iter().any(|inst| matches!(
        inst,
        IrInstruction::Alloca { ty: IrType::Struct(name), .. } if name == "simple"
    )));

    // Five redzones registered right after the alloca, removed at return
    let add = extern_id(&module, "rz_add");
    let rm = extern_id(&module, "rz_rm");
    assert_eq!(calls_to(func, add), 5);
    assert_eq!(calls_to(func, rm), 5);

    // Every one of the 6 stores and 1 load is checked
    let check = extern_id(&module, "rz_check");
    assert_eq!(calls_to(func, check), 7);

    // Each check precedes its access: the last instruction before every
    // store must be the check call
    for block in func.cfg.blocks.values() {
        for (i, inst) in block.instructions.iter().enumerate() {
            if matches!(inst, IrInstruction::Store { .. } | IrInstruction::Load { .. }) {
                assert!(matches!(
                    &block.instructions[i - 1],
                    IrInstruction::CallDirect { func_id, .. } if *func_id == check
                ));
            }
        }
    }

    // Exactly one link-sanity probe, first in the entry block
    let probe = extern_id(&module, "rt_probe");
    assert_eq!(calls_to(func, probe), 1);
    let entry = &func.cfg.blocks[&func.cfg.entry_block];
    assert!(matches!(
        &entry.instructions[0],
        IrInstruction::CallDirect { func_id, .. } if *func_id == probe
    ));

    assert!(module.verify().is_ok());
}

#[test]
fn member_accesses_are_remapped() {
    let (mut module, main) = stack_program();
    run_pass(&mut module);

    let func = &module.functions[&main];
    // Original member indices 0,1,1,2,2,2 become 1,3,3,5,5,5; trailing
    // byte indices within the member arrays stay put.
    let mut member_indices = Vec::new();
    for inst in instructions_of(func) {
        if let IrInstruction::GetElementPtr {
            source_ty: IrType::Struct(name),
            indices,
            ..
        } = inst
        {
            if name == "simple.inflated" {
                if let GepIndex::Const(i) = indices[1] {
                    member_indices.push(i);
                }
            }
        }
    }
    // 6 program accesses (the redzone-registration geps address the
    // even indices, filter them out)
    let program_accesses: Vec<i64> = member_indices
        .iter()
        .copied()
        .filter(|i| i % 2 == 1)
        .collect();
    assert_eq!(program_accesses, vec![1, 3, 3, 5, 5, 5]);
}

/// Property: the inflated member offset equals the original offset plus
/// one redzone per preceding member plus the leading redzone.
#[test]
fn inflated_offsets_shift_by_redzones() {
    let (mut module, _) = stack_program();
    run_pass(&mut module);

    let inflated = module.struct_def("simple.inflated").unwrap().clone();
    let original = module.struct_def("simple").unwrap().clone();

    let mut original_offset = 0u64;
    for i in 0..original.members.len() {
        let inflated_index = 2 * i + 1;
        let inflated_offset: u64 = inflated.members[..inflated_index]
            .iter()
            .map(|m| module.alloc_size(m).unwrap())
            .sum();
        assert_eq!(
            inflated_offset,
            original_offset + (i as u64 + 1) * REDZONE_SIZE
        );
        original_offset += module.alloc_size(&original.members[i]).unwrap();
    }
}

#[test]
fn nested_struct_redzones_cover_both_levels() {
    let mut b = ModuleBuilder::new("nested");
    let simple = define_simple(&mut b);
    let nested = b.define_struct("nested", vec![IrType::I32, simple.clone()]);
    let main = b.begin_function("main").returns(IrType::I32).build();
    b.set_current_function(main);
    let entry = b.create_block("entry");
    b.set_insert_point(entry);
    let e = b.alloca(nested.clone());
    // e.one.one[0] = 0
    let ptr = b.gep(
        e,
        nested,
        vec![
            GepIndex::Const(0),
            GepIndex::Const(1),
            GepIndex::Const(1),
            GepIndex::Const(0),
        ],
    );
    let zero = b.const_val(IrValue::I8(0), IrType::I8);
    b.store(ptr, zero);
    let ret = b.const_i32(0);
    b.ret(Some(ret));
    let mut module = b.finish();

    run_pass(&mut module);

    let func = &module.functions[&main];
    // Outer struct contributes 3 redzones, the nested inner one 5
    let add = extern_id(&module, "rz_add");
    assert_eq!(calls_to(func, add), 8);

    // The nested member access remapped on both levels: [0,1,1,0] -> [0,3,3,0]
    let remapped = instructions_of(func).iter().any(|inst| {
        matches!(
            inst,
            IrInstruction::GetElementPtr { source_ty: IrType::Struct(name), indices, .. }
                if name == "nested.inflated"
                    && indices.len() == 4
                    && indices[1] == GepIndex::Const(3)
                    && indices[2] == GepIndex::Const(3)
                    && indices[3] == GepIndex::Const(0)
        )
    });
    assert!(remapped);
    assert!(module.verify().is_ok());
}

#[test]
fn heap_allocation_is_scaled_and_instrumented() {
    let mut b = ModuleBuilder::new("heap");
    let simple = define_simple(&mut b);
    let malloc = b.declare_extern("malloc", vec![IrType::U64], IrType::U8.ptr_to());
    let free = b.declare_extern("free", vec![IrType::U8.ptr_to()], IrType::Void);
    let main = b.begin_function("main").returns(IrType::I32).build();
    b.set_current_function(main);
    let entry = b.create_block("entry");
    b.set_insert_point(entry);

    // simple *e = malloc(2 * sizeof(struct simple));
    let size = b.const_u64(20);
    let raw = b.call(malloc, vec![size], IrType::U8.ptr_to()).unwrap();
    let typed = b.bitcast(raw, simple.clone().ptr_to());
    // e[1].one[0] = 1
    let ptr = b.gep(
        typed,
        simple,
        vec![
            GepIndex::Const(1),
            GepIndex::Const(1),
            GepIndex::Const(0),
        ],
    );
    let one = b.const_val(IrValue::I8(1), IrType::I8);
    b.store(ptr, one);
    let _ = b.call(free, vec![raw], IrType::Void);
    let ret = b.const_i32(0);
    b.ret(Some(ret));
    let mut module = b.finish();

    run_pass(&mut module);
    let func = &module.functions[&main];
    let insts = instructions_of(func);

    // 2 * original 10 bytes became 2 * inflated 15 bytes
    let malloc_id = extern_id(&module, "malloc");
    let size_arg = insts
        .iter()
        .find_map(|inst| match inst {
            IrInstruction::CallDirect { func_id, args, .. } if *func_id == malloc_id => {
                Some(args[0])
            }
            _ => None,
        })
        .unwrap();
    let scaled = insts
        .iter()
        .find_map(|inst| match inst {
            IrInstruction::Const { dest, value } if *dest == size_arg => value.as_uint(),
            _ => None,
        })
        .unwrap();
    assert_eq!(scaled, 2 * (10 + 5 * REDZONE_SIZE));

    // Per-element redzones for both elements, no stack removals
    let add = extern_id(&module, "rz_add");
    let rm = extern_id(&module, "rz_rm");
    assert_eq!(calls_to(func, add), 10);
    assert_eq!(calls_to(func, rm), 0);

    // The deallocation is preceded by the heap deregistration hook
    let free_hook = extern_id(&module, "rz_heap_free");
    assert_eq!(calls_to(func, free_hook), 1);
    for block in func.cfg.blocks.values() {
        for (i, inst) in block.instructions.iter().enumerate() {
            if matches!(inst, IrInstruction::CallDirect { func_id, .. } if *func_id == extern_id(&module, "free"))
            {
                assert!(matches!(
                    &block.instructions[i - 1],
                    IrInstruction::CallDirect { func_id, .. } if *func_id == free_hook
                ));
            }
        }
    }

    assert!(module.verify().is_ok());
}

#[test]
fn phi_merged_allocations_keep_shape() {
    let mut b = ModuleBuilder::new("phi");
    let simple = define_simple(&mut b);
    let main = b
        .begin_function("main")
        .param("c", IrType::Bool)
        .returns(IrType::I32)
        .build();
    b.set_current_function(main);
    let entry = b.create_block("entry");
    let left = b.create_block("left");
    let right = b.create_block("right");
    let join = b.create_block("join");

    b.set_insert_point(entry);
    b.cond_br(b.param(0), left, right);

    b.set_insert_point(left);
    let a = b.alloca(simple.clone());
    b.br(join);

    b.set_insert_point(right);
    let c = b.alloca(simple.clone());
    b.br(join);

    b.set_insert_point(join);
    let merged = b.phi(simple.clone().ptr_to(), vec![(left, a), (right, c)]);
    let zero_ptr = b.gep(
        merged,
        simple,
        vec![GepIndex::Const(0), GepIndex::Const(0)],
    );
    let loaded = b.load(zero_ptr, IrType::I32);
    b.ret(Some(loaded));
    let mut module = b.finish();

    run_pass(&mut module);

    let func = &module.functions[&main];
    let join_block = &func.cfg.blocks[&join];
    assert_eq!(
        join_block.phi_nodes[0].ty,
        IrType::Struct("simple.inflated".into()).ptr_to()
    );
    assert_eq!(join_block.phi_nodes[0].incoming.len(), 2);

    // Both branch allocations registered their redzones, and both return
    // paths deregister them
    let add = extern_id(&module, "rz_add");
    assert_eq!(calls_to(func, add), 10);
    assert!(module.verify().is_ok());
}

#[test]
fn external_call_goes_through_wrapper() {
    let mut b = ModuleBuilder::new("libc");
    let stat_buf = b.define_struct("stat_buf", vec![IrType::U64, IrType::U64, IrType::U32]);
    let stat = b.declare_extern(
        "stat",
        vec![IrType::I8.ptr_to(), stat_buf.clone().ptr_to()],
        IrType::I32,
    );
    let main = b
        .begin_function("main")
        .returns(IrType::I32)
        .build();
    b.set_current_function(main);
    let entry = b.create_block("entry");
    b.set_insert_point(entry);
    let path = b.alloca(IrType::I8.array_of(8));
    let path_ptr = b.bitcast(path, IrType::I8.ptr_to());
    let buf = b.alloca(stat_buf.clone());
    let res = b.call(stat, vec![path_ptr, buf], IrType::I32).unwrap();
    b.ret(Some(res));
    let mut module = b.finish();

    run_pass(&mut module);

    // main calls the wrapper stub, which is the only caller of the extern
    let stub_id = module.function_id_by_name("stat.inflated").unwrap();
    let stat_id = extern_id(&module, "stat");
    let func = &module.functions[&main];
    assert_eq!(calls_to(func, stub_id), 1);
    assert_eq!(calls_to(func, stat_id), 0);

    let stub = &module.functions[&stub_id];
    assert_eq!(calls_to(stub, stat_id), 1);

    // The wrapper materializes a deflated copy and copies 3 members each
    // way around the call
    let copies = instructions_of(stub)
        .iter()
        .filter(|inst| matches!(inst, IrInstruction::MemCopy { .. }))
        .count();
    assert_eq!(copies, 6);

    assert!(module.verify().is_ok());
}

#[test]
fn globals_are_retyped_and_registered() {
    let mut b = ModuleBuilder::new("globals");
    let simple = define_simple(&mut b);
    let gid = b.define_global("shared", simple.clone());
    let main = b.begin_function("main").returns(IrType::I32).build();
    b.set_current_function(main);
    let entry = b.create_block("entry");
    b.set_insert_point(entry);
    let base = b.global_addr(gid);
    let ptr = b.gep(
        base,
        simple,
        vec![GepIndex::Const(0), GepIndex::Const(0)],
    );
    let seven = b.const_i32(7);
    b.store(ptr, seven);
    let ret = b.const_i32(0);
    b.ret(Some(ret));
    let mut module = b.finish();

    run_pass(&mut module);

    assert_eq!(
        module.globals[&gid].ty,
        IrType::Struct("simple.inflated".into())
    );

    // Global redzones registered once at entry, never removed
    let func = &module.functions[&main];
    let add = extern_id(&module, "rz_add");
    let rm = extern_id(&module, "rz_rm");
    assert_eq!(calls_to(func, add), 5);
    assert_eq!(calls_to(func, rm), 0);
    assert!(module.verify().is_ok());
}

#[test]
fn pass_runs_from_registry_pipeline() {
    let (mut module, _) = stack_program();

    let mut registry = PassRegistry::new();
    register_passes(&mut registry);
    let mut manager = registry.parse_pipeline("structzone-sanitizer").unwrap();
    let result = manager.run(&mut module).unwrap();

    assert!(result.modified);
    assert_eq!(result.stats["structs_inflated"], 1);
    assert!(result.stats["redzones_registered"] >= 5);
    assert!(module.struct_def("simple.inflated").is_some());
}

#[test]
fn reserved_names_abort_the_pass() {
    let mut b = ModuleBuilder::new("reserved");
    b.define_struct("simple.inflated", vec![IrType::I32]);
    let mut module = b.finish();
    assert!(StructZoneSanitizer::new().run(&mut module).is_err());
}
