
mod host_tests;
mod storage_tests;
