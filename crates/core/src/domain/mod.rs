pub mod approval;
pub mod expense;
pub mod ocr;
pub mod rule;
pub mod user;
