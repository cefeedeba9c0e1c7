pub mod types;

pub use types::{
    Attributes, Origin, Payload, ReturnSpec, RunReport, RuntimeSnapshot, Summary, TestCase,
    TestResult,
};
