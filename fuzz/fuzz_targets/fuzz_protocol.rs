// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fuzz target for command, request and acknowledgment parsing and path
//! translation

#![no_main]

use libfuzzer_sys::fuzz_target;
use shardfs_core::{Ack, Command, Extension, NamespaceTranslator, NodeRequest};

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Anything that parses must print back to something that parses the same way
        if let Ok(command) = Command::parse(input) {
            assert_eq!(Command::parse(&command.to_string()).ok(), Some(command));
        }
        if let Ok(request) = NodeRequest::parse(input) {
            assert_eq!(NodeRequest::parse(&request.to_string()).ok(), Some(request));
        }
        if let Some(ack) = Ack::parse(input) {
            let _ = ack.to_string();
        }
        let _ = Extension::of(input);

        let translator = NamespaceTranslator::new("/home/fuzz", ["s1", "s2", "s3", "s4"]);
        if let Ok(rewritten) = translator.rewrite(input, "s2") {
            assert_eq!(translator.rewrite(&rewritten, "s2").ok(), Some(rewritten.clone()));
            let resolved = translator.resolve(input, "s2").unwrap();
            assert!(resolved.starts_with("/home/fuzz/s2"));
        }
    }
});
