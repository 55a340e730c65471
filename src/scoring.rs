use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionKind {
    MultipleChoice,
    TrueFalse,
    ShortAnswer,
}

impl QuestionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QuestionKind::MultipleChoice => "multiple_choice",
            QuestionKind::TrueFalse => "true_false",
            QuestionKind::ShortAnswer => "short_answer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "multiple_choice" => Some(QuestionKind::MultipleChoice),
            "true_false" => Some(QuestionKind::TrueFalse),
            "short_answer" => Some(QuestionKind::ShortAnswer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionSpec {
    pub text: String,
    pub is_correct: bool,
}

/// One question as the engine sees it: the authoritative option flags plus the
/// point value. Options apply to choice kinds; `correct_answer` to short answer.
#[derive(Debug, Clone)]
pub struct QuestionSpec {
    pub id: String,
    pub kind: QuestionKind,
    pub points: f64,
    pub options: Vec<OptionSpec>,
    pub correct_answer: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedAnswer {
    pub question_id: String,
    #[serde(default)]
    pub selected_value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradedAnswer {
    pub question_id: String,
    pub selected_value: serde_json::Value,
    pub is_correct: bool,
    pub points_awarded: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptScore {
    pub score: f64,
    pub total_points: f64,
    pub percentage: i64,
    pub answers: Vec<GradedAnswer>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ScoreError {
    fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

/// Integer percentage, safe against an all-zero bank.
pub fn percentage(score: f64, total_points: f64) -> i64 {
    if total_points <= 0.0 {
        return 0;
    }
    (100.0 * score / total_points).round() as i64
}

fn answer_is_correct(question: &QuestionSpec, selected: &serde_json::Value) -> bool {
    match question.kind {
        QuestionKind::MultipleChoice | QuestionKind::TrueFalse => {
            let Some(idx) = selected.as_u64() else {
                return false;
            };
            question
                .options
                .get(idx as usize)
                .map(|opt| opt.is_correct)
                .unwrap_or(false)
        }
        QuestionKind::ShortAnswer => {
            let Some(expected) = question.correct_answer.as_deref() else {
                return false;
            };
            let Some(given) = selected.as_str() else {
                return false;
            };
            given.trim().eq_ignore_ascii_case(expected.trim())
        }
    }
}

/// Scores one attempt against the question bank. Pure and idempotent: the same
/// inputs always produce the same output, which is what makes a manual rescore
/// after a bank correction safe.
///
/// `total_points` sums only the questions actually answered in the attempt,
/// not the whole bank, and each question may be answered at most once. Full
/// points on exact match, zero otherwise; there is no partial credit here.
pub fn score_attempt(
    answers: &[SubmittedAnswer],
    bank: &HashMap<String, QuestionSpec>,
) -> Result<AttemptScore, ScoreError> {
    let mut score = 0.0;
    let mut total_points = 0.0;
    let mut graded = Vec::with_capacity(answers.len());
    let mut seen = HashSet::with_capacity(answers.len());

    for answer in answers {
        // One answer per question; a repeated id would count its points twice.
        if !seen.insert(answer.question_id.as_str()) {
            return Err(ScoreError {
                details: Some(json!({ "questionId": answer.question_id })),
                ..ScoreError::new("validation_error", "duplicate answer for a question")
            });
        }
        let Some(question) = bank.get(&answer.question_id) else {
            return Err(ScoreError {
                details: Some(json!({ "questionId": answer.question_id })),
                ..ScoreError::new("not_found", "answer references an unknown question")
            });
        };

        total_points += question.points;
        let is_correct = answer_is_correct(question, &answer.selected_value);
        let points_awarded = if is_correct { question.points } else { 0.0 };
        score += points_awarded;

        graded.push(GradedAnswer {
            question_id: answer.question_id.clone(),
            selected_value: answer.selected_value.clone(),
            is_correct,
            points_awarded,
        });
    }

    Ok(AttemptScore {
        score,
        total_points,
        percentage: percentage(score, total_points),
        answers: graded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mcq(id: &str, points: f64, correct_idx: usize) -> QuestionSpec {
        QuestionSpec {
            id: id.to_string(),
            kind: QuestionKind::MultipleChoice,
            points,
            options: (0..4)
                .map(|i| OptionSpec {
                    text: format!("option {}", i),
                    is_correct: i == correct_idx,
                })
                .collect(),
            correct_answer: None,
        }
    }

    fn bank(questions: Vec<QuestionSpec>) -> HashMap<String, QuestionSpec> {
        questions.into_iter().map(|q| (q.id.clone(), q)).collect()
    }

    fn answer(question_id: &str, selected: serde_json::Value) -> SubmittedAnswer {
        SubmittedAnswer {
            question_id: question_id.to_string(),
            selected_value: selected,
        }
    }

    #[test]
    fn five_questions_three_correct_is_sixty_percent() {
        let bank = bank((0..5).map(|i| mcq(&format!("q{}", i), 2.0, 1)).collect());
        let answers: Vec<SubmittedAnswer> = (0..5)
            .map(|i| answer(&format!("q{}", i), json!(if i < 3 { 1 } else { 2 })))
            .collect();

        let result = score_attempt(&answers, &bank).unwrap();
        assert_eq!(result.score, 6.0);
        assert_eq!(result.total_points, 10.0);
        assert_eq!(result.percentage, 60);
        assert_eq!(result.answers.iter().filter(|a| a.is_correct).count(), 3);
    }

    #[test]
    fn percentage_is_zero_when_total_is_zero() {
        assert_eq!(percentage(0.0, 0.0), 0);
        let result = score_attempt(&[], &HashMap::new()).unwrap();
        assert_eq!(result.percentage, 0);
        assert_eq!(result.total_points, 0.0);
    }

    #[test]
    fn percentage_rounds_to_nearest_integer() {
        assert_eq!(percentage(1.0, 3.0), 33);
        assert_eq!(percentage(2.0, 3.0), 67);
        assert_eq!(percentage(1.0, 2.0), 50);
    }

    #[test]
    fn total_counts_answered_questions_only() {
        let bank = bank(vec![mcq("q0", 2.0, 0), mcq("q1", 3.0, 0)]);
        let result = score_attempt(&[answer("q0", json!(0))], &bank).unwrap();
        assert_eq!(result.total_points, 2.0);
        assert_eq!(result.score, 2.0);
        assert_eq!(result.percentage, 100);
    }

    #[test]
    fn unknown_question_is_reported_not_skipped() {
        let bank = bank(vec![mcq("q0", 2.0, 0)]);
        let err = score_attempt(&[answer("ghost", json!(0))], &bank).unwrap_err();
        assert_eq!(err.code, "not_found");
    }

    #[test]
    fn repeated_answer_cannot_pad_the_total() {
        let bank = bank(vec![mcq("q0", 2.0, 1), mcq("q1", 2.0, 1)]);
        // One real correct answer; repeating it would read as 4/6 = 67%
        // instead of the honest 2/4 = 50%.
        let padded = vec![
            answer("q0", json!(1)),
            answer("q0", json!(1)),
            answer("q1", json!(0)),
        ];
        let err = score_attempt(&padded, &bank).unwrap_err();
        assert_eq!(err.code, "validation_error");

        let honest = vec![answer("q0", json!(1)), answer("q1", json!(0))];
        let result = score_attempt(&honest, &bank).unwrap();
        assert_eq!(result.percentage, 50);
    }

    #[test]
    fn out_of_range_option_index_is_wrong_not_an_error() {
        let bank = bank(vec![mcq("q0", 2.0, 0)]);
        let result = score_attempt(&[answer("q0", json!(99))], &bank).unwrap();
        assert!(!result.answers[0].is_correct);
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn short_answer_matches_case_insensitively() {
        let q = QuestionSpec {
            id: "sa".to_string(),
            kind: QuestionKind::ShortAnswer,
            points: 5.0,
            options: vec![],
            correct_answer: Some("Photosynthesis".to_string()),
        };
        let bank = bank(vec![q]);

        let hit = score_attempt(&[answer("sa", json!("  photosynthesis "))], &bank).unwrap();
        assert_eq!(hit.score, 5.0);

        let miss = score_attempt(&[answer("sa", json!("respiration"))], &bank).unwrap();
        assert_eq!(miss.score, 0.0);
    }

    #[test]
    fn rerunning_the_engine_is_idempotent() {
        let bank = bank(vec![mcq("q0", 2.0, 1), mcq("q1", 2.0, 0)]);
        let answers = vec![answer("q0", json!(1)), answer("q1", json!(3))];
        let first = score_attempt(&answers, &bank).unwrap();
        let second = score_attempt(&answers, &bank).unwrap();
        assert_eq!(first.score, second.score);
        assert_eq!(first.percentage, second.percentage);
        assert_eq!(first.answers.len(), second.answers.len());
    }
}
