pub mod line_item_writer;
