//! Shared helpers for integration tests

#![allow(dead_code)]

use kestrel_engine::bytecode::{FunctionBody, FunctionBuilder, FunctionDefinition, FunctionId};
use kestrel_engine::vm::CapturedOutput;
use kestrel_engine::{Instruction, RuntimeConfig, TypeId, Vm};

/// Small VM with every in-memory log switched on and output captured
pub fn test_vm() -> (Vm, CapturedOutput) {
    let config = RuntimeConfig {
        heap_size: 256 * 1024,
        stack_size: 256 * 1024,
        call_stack_capacity: 256,
        ..RuntimeConfig::default()
    }
    .with_logging();
    vm_with(config)
}

pub fn vm_with(config: RuntimeConfig) -> (Vm, CapturedOutput) {
    let mut vm = Vm::new(config).unwrap();
    let output = CapturedOutput::new();
    vm.set_output(output.clone());
    (vm, output)
}

/// Define `main() -> Int` from a raw body
pub fn define_main(vm: &mut Vm, locals: Vec<TypeId>, instructions: Vec<Instruction>) -> FunctionId {
    let int = vm.types().int();
    vm.add_function(
        FunctionDefinition::new("main", vec![], int),
        FunctionBody {
            locals,
            instructions,
        },
    )
    .unwrap()
}

/// Define `main() -> Int` from a builder
pub fn define_main_with(vm: &mut Vm, builder: FunctionBuilder) -> FunctionId {
    let int = vm.types().int();
    vm.add_function(FunctionDefinition::new("main", vec![], int), builder.finish().unwrap())
        .unwrap()
}

/// Load the unit and run `main`
pub fn load_and_run(vm: &mut Vm) -> i32 {
    vm.load().unwrap();
    vm.run_main().unwrap()
}
