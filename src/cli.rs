//! Utility to parse command line arguments for server and client programs.

use std::env::Args;


const DEFAULT_UPDATE_NUM: usize = 20;


/// Utility class to help with command line option parsing.
pub struct ArgParser {
    args: Args,
    usage: &'static str,
}

impl ArgParser {
    pub fn new(mut args: Args, usage: &'static str) -> Self {
        let _ = args.next();
        Self { args, usage }
    }

    /// Next positional argument, required.
    pub fn extract_required(&mut self, name: &str) -> String {
        match self.args.next() {
            Some(value) => value,
            None => panic!("missing argument <{}>. {}", name, self.usage),
        }
    }

    /// Next positional argument, or [None] when absent.
    pub fn extract_optional(&mut self) -> Option<String> {
        self.args.next()
    }

    pub fn extract_update_num(&mut self) -> usize {
        let num_str = self.args.next();
        let num_res = num_str.as_deref().map(|s| s.parse()).unwrap_or(Ok(DEFAULT_UPDATE_NUM));
        match num_res {
            Err(_) => panic!("could not parse provided number {} as usize", num_str.unwrap()),
            Ok(n) => n,
        }
    }

    pub fn extract_port(&mut self, default_port: u16) -> u16 {
        let port_str = self.args.next();
        let port_res = port_str.as_deref().map(|s| s.parse()).unwrap_or(Ok(default_port));
        match port_res {
            Err(_) => panic!("could not parse provided port number {} as u16", port_str.unwrap()),
            Ok(p) => p,
        }
    }
}
