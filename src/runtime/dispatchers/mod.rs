pub(crate) mod orchestration;
pub(crate) mod worker;
