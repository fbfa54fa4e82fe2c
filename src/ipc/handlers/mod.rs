pub mod analytics;
pub mod attendance;
pub mod core;
pub mod grade_types;
pub mod homework;
pub mod lessons;
pub mod maintenance;
pub mod marks;
pub mod periods;
pub mod quarterly;
pub mod roster;
pub mod yearly;
