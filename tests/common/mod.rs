//! Builders shared by the integration suites.

#![allow(dead_code)]

use riptide::ir::{Function, Op};
use riptide::{FuncType, Instance, Module, Runtime, Val, ValType};

pub fn func(name: &str, params: &[ValType], results: &[ValType], locals: &[ValType], body: Vec<Op>) -> Function {
    Function::new(name, FuncType::new(params, results), locals.to_vec(), body)
}

/// A module exporting one function under `name`.
pub fn single_func(name: &str, params: &[ValType], results: &[ValType], body: Vec<Op>) -> Module {
    let mut m = Module::new();
    let f = m.add_function(func(name, params, results, &[], body));
    m.export(name, f);
    m
}

pub fn instantiate(m: &Module) -> Instance {
    Runtime::new().instantiate(m).unwrap()
}

/// Instantiates `m` and calls export `name` once.
pub fn run(m: &Module, name: &str, args: &[Val]) -> riptide::Result<Vec<Val>> {
    instantiate(m).call(name, args)
}

pub fn i32s(vals: &[i32]) -> Vec<Val> {
    vals.iter().map(|&v| Val::I32(v)).collect()
}
