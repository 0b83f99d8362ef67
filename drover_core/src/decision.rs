use std::collections::VecDeque;
use std::io::{self, BufRead, Write};

/// Answers yes/no questions that gate destructive operations.
pub trait DecisionProvider {
    fn confirm(&mut self, question: &str) -> bool;
}

/// Asks the operator on the terminal. Anything not starting with `y` is a no.
#[derive(Debug, Default)]
pub struct InteractivePrompt;

impl DecisionProvider for InteractivePrompt {
    fn confirm(&mut self, question: &str) -> bool {
        print!("[?] {question} [y/n]...: ");
        let _ = io::stdout().flush();
        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line).is_err() {
            return false;
        }
        is_yes(&line)
    }
}

fn is_yes(answer: &str) -> bool {
    answer.trim_start().starts_with(['y', 'Y'])
}

/// Pre-recorded answers, consumed in order. Once exhausted, `fallback` is returned.
#[derive(Debug, Default)]
pub struct ScriptedDecisions {
    answers: VecDeque<bool>,
    fallback: bool,
    pub asked: Vec<String>,
}

impl ScriptedDecisions {
    pub fn new(answers: impl IntoIterator<Item = bool>) -> Self {
        Self {
            answers: answers.into_iter().collect(),
            fallback: false,
            asked: Vec::new(),
        }
    }

    pub fn always(answer: bool) -> Self {
        Self {
            answers: VecDeque::new(),
            fallback: answer,
            asked: Vec::new(),
        }
    }
}

impl DecisionProvider for ScriptedDecisions {
    fn confirm(&mut self, question: &str) -> bool {
        self.asked.push(question.to_string());
        self.answers.pop_front().unwrap_or(self.fallback)
    }
}
