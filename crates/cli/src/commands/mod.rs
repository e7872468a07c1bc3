pub mod bootstrap;
pub mod check;
pub mod doctor;
pub mod run;
