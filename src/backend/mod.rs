pub mod analyze;
pub mod pcf;
pub mod prv;
pub mod row;
