pub mod cancellation_reader;
pub mod report_writer;
