pub mod attendance;
pub mod backup;
pub mod core;
pub mod exams;
pub mod fees;
pub mod parents;
pub mod payments;
pub mod reports;
pub mod schools;
pub mod staff;
pub mod students;
