pub mod extent_reader;
pub mod extent_writer;
pub mod tfrac;
pub mod trace_frame;
pub mod trace_stream;
