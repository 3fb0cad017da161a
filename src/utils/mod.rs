pub mod shell;
pub mod suggest;
pub mod template;
