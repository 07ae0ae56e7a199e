pub mod filesystem;
pub mod imports;
pub mod interpreter;
pub mod pipeline;
pub mod resolver;
pub mod scanner;
pub mod worker;
