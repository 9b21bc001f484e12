//! Integration tests for prompt detection driving keystroke routing
//!
//! Run with: cargo test --test input_service_test

use pretty_assertions::assert_eq;
use termsession::terminal::input::{InputService, Key, KeyOutcome, DEFAULT_HISTORY_LIMIT};
use termsession::terminal::prompt::{Detection, InputMode, PromptDetector};

struct Harness {
    detector: PromptDetector,
    input: InputService<Vec<u8>>,
}

impl Harness {
    fn new() -> Self {
        Self {
            detector: PromptDetector::default(),
            input: InputService::new(Vec::new(), DEFAULT_HISTORY_LIMIT),
        }
    }

    /// Output from the child, as the session routes it
    fn output(&mut self, text: &str) -> Option<Detection> {
        let detection = self.detector.feed(text);
        if let Some(detection) = &detection {
            self.input.apply_detection(detection);
        }
        detection
    }

    fn type_text(&mut self, text: &str) {
        for c in text.chars() {
            self.input.handle_key(Key::Char(c));
        }
    }

    fn enter(&mut self) -> KeyOutcome {
        let outcome = self.input.handle_key(Key::Enter);
        if outcome != KeyOutcome::Handled {
            self.detector.reset();
        }
        outcome
    }

    fn sent(&mut self) -> Vec<u8> {
        std::mem::take(self.input.sink_mut())
    }
}

#[test]
fn test_password_prompt_flow() {
    let mut h = Harness::new();
    h.output("$ sudo true\r\n");
    h.output("[sudo] password for dev: ");
    assert_eq!(h.input.mode(), InputMode::Password);
    assert_eq!(h.input.prompt_label(), Some("sudo password"));

    h.type_text("s3cret");
    assert_eq!(h.input.display_buffer(), "••••••");
    assert!(h.sent().is_empty());

    h.enter();
    assert_eq!(h.sent(), b"s3cret\n");
    assert!(h.input.history().is_empty());
}

#[test]
fn test_shell_prompt_returns_to_normal() {
    let mut h = Harness::new();
    h.output("Continue? [y/n] ");
    assert_eq!(h.input.mode(), InputMode::Interactive);

    h.type_text("y");
    assert_eq!(h.sent(), b"y");
    h.enter();
    assert_eq!(h.sent(), b"\n");

    assert_eq!(h.output("done\r\nuser@host:~$ "), Some(Detection::ShellPrompt));
    assert_eq!(h.input.mode(), InputMode::Normal);
}

#[test]
fn test_progress_output_keeps_interactive_mode() {
    let mut h = Harness::new();
    h.output("Do you want to continue? [Y/n] ");
    assert_eq!(h.input.mode(), InputMode::Interactive);
    h.type_text("y");
    h.enter();

    // The command is still running, so the elevated mode must survive
    assert_eq!(h.output("y\r\nReading database ... 45%"), None);
    assert_eq!(h.input.mode(), InputMode::Interactive);
    assert_eq!(h.output("\rReading database ... 100%\r\n"), None);
    assert_eq!(h.input.mode(), InputMode::Interactive);
}

#[test]
fn test_history_navigation() {
    let mut h = Harness::new();
    for command in ["ls", "pwd"] {
        h.type_text(command);
        h.enter();
    }

    h.input.handle_key(Key::ArrowUp);
    h.input.handle_key(Key::ArrowUp);
    assert_eq!(h.input.buffer(), "ls");
    h.input.handle_key(Key::ArrowDown);
    assert_eq!(h.input.buffer(), "pwd");
    h.input.handle_key(Key::ArrowDown);
    assert_eq!(h.input.buffer(), "");
}

#[test]
fn test_history_cap() {
    let mut input = InputService::new(Vec::new(), 3);
    for i in 0..5 {
        input.send_input(&format!("cmd{i}"));
    }
    let entries: Vec<&str> = input.history().entries().collect();
    assert_eq!(entries, vec!["cmd2", "cmd3", "cmd4"]);
}

#[test]
fn test_ctrl_c_during_prompt() {
    let mut h = Harness::new();
    h.output("Password: ");
    h.type_text("half");

    assert_eq!(h.input.handle_key(Key::CtrlC), KeyOutcome::Interrupted);
    assert_eq!(h.sent(), vec![0x03]);
    assert_eq!(h.input.buffer(), "");
    assert_eq!(h.input.mode(), InputMode::Normal);
}

#[test]
fn test_host_key_confirmation() {
    let mut h = Harness::new();
    h.output("The authenticity of host 'srv (10.0.0.2)' can't be established.\r\n");
    h.output("Are you sure you want to continue connecting (yes/no/[fingerprint])? ");
    assert_eq!(h.input.mode(), InputMode::Interactive);
    assert_eq!(h.input.prompt_label(), Some("host verification"));

    h.type_text("yes");
    h.enter();
    assert_eq!(h.sent(), b"yes\n");
}

#[test]
fn test_special_keys_by_mode() {
    let mut h = Harness::new();
    h.input.handle_key(Key::Tab);
    h.input.handle_key(Key::CtrlD);
    assert_eq!(h.sent(), vec![b'\t', 0x04]);

    h.output("Password: ");
    h.input.handle_key(Key::Tab);
    h.input.handle_key(Key::ArrowUp);
    h.type_text("ab");
    h.input.handle_key(Key::Backspace);
    assert!(h.sent().is_empty());
    assert_eq!(h.input.buffer(), "a");
}

#[test]
fn test_multiline_submission() {
    let mut input = InputService::new(Vec::new(), DEFAULT_HISTORY_LIMIT);
    input.set_mode(InputMode::Multiline);
    for c in "a".chars() {
        input.send_character(c);
    }
    input.handle_key(Key::Newline);
    input.send_character('b');

    let outcome = input.submit_current_input();
    assert_eq!(
        outcome,
        KeyOutcome::Submitted {
            text: "a\nb".to_string(),
            mode: InputMode::Multiline
        }
    );
    assert_eq!(input.sink().as_slice(), b"a\nb\n");
}

#[test]
fn test_detector_ignores_prompt_text_in_scrollback() {
    let mut h = Harness::new();
    h.output("grep password: config.yml\n");
    h.output("config.yml:3: password: xyz\n");
    assert_eq!(h.input.mode(), InputMode::Normal);
}
