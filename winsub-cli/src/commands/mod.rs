pub mod info;
pub mod mutate;
pub mod run;
