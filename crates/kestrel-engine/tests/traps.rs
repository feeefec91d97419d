//! Runtime traps and fatal errors surfaced through `VmError`

mod common;

use common::{define_main, test_vm, vm_with};
use kestrel_engine::bytecode::{FunctionBody, FunctionDefinition};
use kestrel_engine::types::{FieldDef, TypeError};
use kestrel_engine::vm::LoadError;
use kestrel_engine::{Instruction, RuntimeConfig, TrapKind, TypeId, VmError};

fn run_expecting_trap(vm: &mut kestrel_engine::Vm) -> VmError {
    vm.load().unwrap();
    vm.run_main().unwrap_err()
}

#[test]
fn test_null_field_load() {
    let (mut vm, _) = test_vm();
    let types = vm.types_mut();
    let int = types.int();
    let point = types.create_class("Point", vec![FieldDef::new("x", int)]).unwrap();
    let x = vm.types().field_ref(point, "x").unwrap();
    define_main(
        &mut vm,
        vec![],
        vec![Instruction::LoadNull(point), Instruction::LoadField(x), Instruction::Return],
    );

    let err = run_expecting_trap(&mut vm);
    assert_eq!(err.trap_kind(), Some(TrapKind::NullReference));
    assert_eq!(err.exit_code(), 3);
    assert!(err.to_string().contains("NullReferenceError"));
    assert!(vm.call_stack().is_empty());
}

#[test]
fn test_null_field_store() {
    let (mut vm, _) = test_vm();
    let types = vm.types_mut();
    let int = types.int();
    let point = types.create_class("Point", vec![FieldDef::new("x", int)]).unwrap();
    let x = vm.types().field_ref(point, "x").unwrap();
    define_main(
        &mut vm,
        vec![],
        vec![
            Instruction::LoadNull(point),
            Instruction::LoadInt(1),
            Instruction::StoreField(x),
            Instruction::LoadInt(0),
            Instruction::Return,
        ],
    );
    assert_eq!(run_expecting_trap(&mut vm).trap_kind(), Some(TrapKind::NullReference));
}

#[test]
fn test_null_receiver_instance_call() {
    let (mut vm, _) = test_vm();
    let types = vm.types_mut();
    let int = types.int();
    let point = types.create_class("Point", vec![]).unwrap();
    let get = vm
        .add_function(
            FunctionDefinition::method(point, "get", vec![], int),
            FunctionBody {
                locals: vec![],
                instructions: vec![Instruction::LoadInt(1), Instruction::Return],
            },
        )
        .unwrap();
    define_main(
        &mut vm,
        vec![],
        vec![Instruction::LoadNull(point), Instruction::CallInstance(get), Instruction::Return],
    );
    assert_eq!(run_expecting_trap(&mut vm).trap_kind(), Some(TrapKind::NullReference));
}

#[test]
fn test_element_index_out_of_bounds() {
    for index in [2, -1] {
        let (mut vm, _) = test_vm();
        let types = vm.types_mut();
        let int = types.int();
        let ints = types.array_of(int).unwrap();
        define_main(
            &mut vm,
            vec![],
            vec![
                Instruction::LoadInt(2),
                Instruction::NewArray(ints),
                Instruction::LoadInt(index),
                Instruction::LoadElement(ints),
                Instruction::Return,
            ],
        );
        assert_eq!(
            run_expecting_trap(&mut vm).trap_kind(),
            Some(TrapKind::ArrayOutOfBounds),
            "index {}",
            index
        );
    }
}

#[test]
fn test_null_array_length() {
    let (mut vm, _) = test_vm();
    let types = vm.types_mut();
    let int = types.int();
    let ints = types.array_of(int).unwrap();
    define_main(
        &mut vm,
        vec![],
        vec![Instruction::LoadNull(ints), Instruction::LoadArrayLength, Instruction::Return],
    );
    assert_eq!(run_expecting_trap(&mut vm).trap_kind(), Some(TrapKind::NullReference));
}

#[test]
fn test_negative_array_length() {
    let (mut vm, _) = test_vm();
    let types = vm.types_mut();
    let float = types.float();
    let floats = types.array_of(float).unwrap();
    define_main(
        &mut vm,
        vec![],
        vec![
            Instruction::LoadInt(-3),
            Instruction::NewArray(floats),
            Instruction::LoadArrayLength,
            Instruction::Return,
        ],
    );
    let err = run_expecting_trap(&mut vm);
    assert_eq!(err.trap_kind(), Some(TrapKind::InvalidArrayCreation));
    assert!(vm.gc().log().allocations().is_empty());
}

#[test]
fn test_divide_by_zero() {
    let (mut vm, _) = test_vm();
    define_main(
        &mut vm,
        vec![],
        vec![
            Instruction::LoadInt(1),
            Instruction::LoadInt(0),
            Instruction::Div,
            Instruction::Return,
        ],
    );
    assert_eq!(run_expecting_trap(&mut vm).trap_kind(), Some(TrapKind::DivideByZero));
}

#[test]
fn test_unbounded_recursion_overflows() {
    let (mut vm, _) = test_vm();
    let int = vm.types().int();
    let forever = vm
        .declare_function(FunctionDefinition::new("forever", vec![int], int))
        .unwrap();
    vm.define_function(
        forever,
        FunctionBody {
            locals: vec![],
            instructions: vec![
                Instruction::LoadArgument(0),
                Instruction::Call(forever),
                Instruction::Return,
            ],
        },
    )
    .unwrap();
    define_main(
        &mut vm,
        vec![],
        vec![Instruction::LoadInt(0), Instruction::Call(forever), Instruction::Return],
    );

    let err = run_expecting_trap(&mut vm);
    assert_eq!(err.trap_kind(), Some(TrapKind::StackOverflow));
    assert!(vm.call_stack().is_empty());
}

#[test]
fn test_heap_exhaustion_is_fatal() {
    let (mut vm, _) = vm_with(RuntimeConfig {
        heap_size: 64 * 1024,
        ..RuntimeConfig::default()
    });
    let types = vm.types_mut();
    let int = types.int();
    let ints = types.array_of(int).unwrap();
    define_main(
        &mut vm,
        vec![],
        vec![
            Instruction::LoadInt(100_000),
            Instruction::NewArray(ints),
            Instruction::LoadArrayLength,
            Instruction::Return,
        ],
    );
    let err = run_expecting_trap(&mut vm);
    assert!(matches!(err, VmError::HeapExhausted { requested, .. } if requested > 64 * 1024));
    assert_eq!(err.exit_code(), 4);
    assert_eq!(vm.gc().stats().collections, 0);
}

#[test]
fn test_verification_failure_aborts_load() {
    let (mut vm, _) = test_vm();
    define_main(
        &mut vm,
        vec![],
        vec![Instruction::LoadFloat(1.0), Instruction::Return],
    );
    let err = vm.load().unwrap_err();
    assert!(matches!(err, VmError::Verify(_)));
    assert_eq!(err.exit_code(), 2);
    assert!(!vm.is_loaded());
    assert!(matches!(vm.run_main(), Err(VmError::Load(LoadError::NotLoaded))));
}

#[test]
fn test_unresolved_type_references_are_rejected() {
    let (mut vm, _) = test_vm();
    let int = vm.types().int();
    let stray = TypeId::from_u32(999).unwrap();

    let err = vm
        .declare_function(FunctionDefinition::new("f", vec![stray], int))
        .unwrap_err();
    assert!(matches!(err, VmError::Type(TypeError::UnknownType(999))));
    assert_eq!(err.exit_code(), 2);

    let err = vm
        .declare_function(FunctionDefinition::new("g", vec![int], stray))
        .unwrap_err();
    assert!(matches!(err, VmError::Type(TypeError::UnknownType(999))));
    assert!(err.to_string().contains("999"));
}

#[test]
fn test_invoke_checks_argument_count() {
    let (mut vm, _) = test_vm();
    let int = vm.types().int();
    let id = vm
        .add_function(
            FunctionDefinition::new("id", vec![int], int),
            FunctionBody {
                locals: vec![],
                instructions: vec![Instruction::LoadArgument(0), Instruction::Return],
            },
        )
        .unwrap();
    vm.load().unwrap();
    let err = vm.invoke(id, &[]).unwrap_err();
    assert!(matches!(
        err,
        VmError::Load(LoadError::ArgumentCount { expected: 1, found: 0, .. })
    ));
    assert_eq!(vm.invoke(id, &[5]).unwrap(), 5);
}
