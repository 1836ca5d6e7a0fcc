// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Recovery from corrupted PS1 metadata blocks.
//!
//! PS1 blocks get corrupted when concurrent terminal output (progress bars,
//! spinners) interleaves with the shell's prompt rendering — a race between
//! the shell writing PS1 and programs writing stdout. The extractor anchors
//! on each end marker and takes only the last opener before it, which
//! recovers the intact re-rendered block.

use tiller_tools::terminal::{count_ps1_ends, extract_ps1_blocks};

/// Corrupted transcript where concurrent stdout interrupts the first PS1
/// block mid-JSON; the second block is intact.
const CORRUPTED_OUTPUT_GRUNT_CAT: &str = r#"
###PS1JSON###
{
  "pid": "",
  "exit_code": "0",
  "username": "dev",
  "hostname": "runtime-uerbtodceoavkhsd-5f46cc485d-297jp",
  "working_dir": "/workspace/p5.js",
  "py_interpreter_path": "/usr/bin/python"
 8   -_-_-_-_-_,------,
 0#PS-_-_-_-_-_|   /\_/\
 0 /w-_-_-_-_-^|__( ^ .^) eout 300 npm test 2>&1 | tail -50
     -_-_-_-_-  ""  ""

  8 passing (6ms)


Done.

###PS1JSON###
{
  "pid": "",
  "exit_code": "0",
  "username": "dev",
  "hostname": "runtime-uerbtodceoavkhsd-5f46cc485d-297jp",
  "working_dir": "/workspace/p5.js",
  "py_interpreter_path": "/usr/bin/python"
}
###PS1END###"#;

/// Another corrupted transcript, with ANSI-era remnants and a nonempty pid.
const CORRUPTED_OUTPUT_ANSI_REMNANTS: &str = r#"
###PS1JSON###
{
  "pid": "877",
  "exit_code": "0",
  "username": "dev",
  "hostname": "runtime-wurijejgnynchahc-f9f4f7f-ndqfp",
  "working_dir": "/workspace/p5.js",
  "py_interpreter_path": "/usr/bin/python"
 8   -_-_-_-_-_,------,
 0#PS-_-_-_-_-_|   /\_/\
 0 /w-_-_-_-_-^|__( ^ .^)  run grunt -- mochaTest:test 2>&1 | tail -30
     -_-_-_-_-  ""  ""

  8 passing (16ms)


Done.

###PS1JSON###
{
  "pid": "877",
  "exit_code": "0",
  "username": "dev",
  "hostname": "runtime-wurijejgnynchahc-f9f4f7f-ndqfp",
  "working_dir": "/workspace/p5.js",
  "py_interpreter_path": "/usr/bin/python"
}
###PS1END###"#;

/// Pager output that takes over the screen and renders no markers at all.
const PAGER_OUTPUT_NO_PS1: &str = r#"Help on class RidgeClassifierCV in sklearn.linear_model:

class RidgeClassifierCV(sklearn.linear_model.base.LinearClassifierMixin, _BaseRidgeCV)
 |  Ridge classifier with built-in cross-validation.
 |
 |  By default, it performs Generalized Cross-Validation, which is a form of
 |  efficient Leave-One-Out cross-validation.
"#;

#[test]
fn corrupted_first_block_recovers_exactly_one_record() {
    let blocks = extract_ps1_blocks(CORRUPTED_OUTPUT_GRUNT_CAT);
    assert_eq!(blocks.len(), 1, "the intact second block wins");
    let m = &blocks[0].metadata;
    assert_eq!(m.exit_code(), Some(0));
    assert_eq!(m.working_dir, "/workspace/p5.js");
    assert_eq!(m.pid(), None, "empty pid string parses to None");
}

#[test]
fn ansi_remnant_corruption_recovers_exactly_one_record() {
    let blocks = extract_ps1_blocks(CORRUPTED_OUTPUT_ANSI_REMNANTS);
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].metadata.pid(), Some(877));
    assert_eq!(blocks[0].metadata.hostname, "runtime-wurijejgnynchahc-f9f4f7f-ndqfp");
}

#[test]
fn pager_output_yields_no_blocks_and_no_completion_signal() {
    assert!(extract_ps1_blocks(PAGER_OUTPUT_NO_PS1).is_empty());
    assert_eq!(count_ps1_ends(PAGER_OUTPUT_NO_PS1), 0);
}

#[test]
fn command_output_containing_marker_text_does_not_break_framing() {
    // A command that *prints* the marker string (e.g. `cat` of this very
    // test file) produces extra openers; the block adjacent to the end
    // marker still wins.
    let transcript = format!(
        "###PS1JSON###\nsome earlier garbage\n{}\n",
        CORRUPTED_OUTPUT_ANSI_REMNANTS
    );
    let blocks = extract_ps1_blocks(&transcript);
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].metadata.pid(), Some(877));
}

#[cfg(unix)]
mod live_session {
    use std::path::Path;
    use std::time::Duration;

    use tiller_tools::terminal::TerminalSession;

    /// A command that emits a spurious opener marker into its own output
    /// completes without error: the valid post-command block still frames
    /// the result.
    #[tokio::test]
    async fn session_survives_marker_noise_in_output() {
        let mut s = TerminalSession::start(Path::new("/tmp")).expect("session");
        let obs = s
            .execute("echo '###PS1JSON###' && echo noise && echo done", false, Duration::from_secs(10))
            .await
            .expect("command completes despite marker noise");
        assert_eq!(obs.exit_code, Some(0));
        assert!(obs.output.contains("done"));
    }
}
