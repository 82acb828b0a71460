// gridc — Grid fabric compiler backend
//
// Library root. Modules are listed leaf-first: fabric model and input
// records, the compilation passes, wire formats, the pass driver and the
// host runtime.

pub mod arch;
pub mod opcode;
pub mod diag;
pub mod microop;
pub mod symtab;
pub mod grid;
pub mod depend;
pub mod place;
pub mod route;
pub mod lmm;
pub mod conf;
pub mod emit;
pub mod pass;
pub mod pipeline;
pub mod runtime;
