pub mod utils;

mod test_reactor;
mod test_worker;
