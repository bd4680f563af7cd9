//! Exam mark aggregation. Marks are plain scores, not money, so f64 is fine
//! here; the finance module owns everything decimal.

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MarkState {
    Absent,
    Scored(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExamSummary {
    pub obtained: f64,
    pub out_of_total: f64,
    pub percent: f64,
    pub grade: &'static str,
    pub pass: bool,
    pub scored_count: usize,
    pub absent_count: usize,
}

pub const PASS_PERCENT: f64 = 40.0;

pub fn letter_grade(percent: f64) -> &'static str {
    if percent >= 90.0 {
        "A+"
    } else if percent >= 80.0 {
        "A"
    } else if percent >= 70.0 {
        "B+"
    } else if percent >= 60.0 {
        "B"
    } else if percent >= 50.0 {
        "C"
    } else if percent >= PASS_PERCENT {
        "D"
    } else {
        "F"
    }
}

/// Aggregates one student's marks across an exam's subjects. An absent
/// subject contributes 0 to the obtained total but its out-of stays in the
/// denominator (a counted zero, not an exclusion).
pub fn summarize<I>(marks: I) -> ExamSummary
where
    I: IntoIterator<Item = (f64, MarkState)>,
{
    let mut obtained = 0.0;
    let mut out_of_total = 0.0;
    let mut scored_count = 0usize;
    let mut absent_count = 0usize;

    for (out_of, state) in marks {
        out_of_total += out_of;
        match state {
            MarkState::Absent => absent_count += 1,
            MarkState::Scored(v) => {
                scored_count += 1;
                obtained += v;
            }
        }
    }

    let percent = if out_of_total > 0.0 {
        100.0 * obtained / out_of_total
    } else {
        0.0
    };

    ExamSummary {
        obtained,
        out_of_total,
        percent,
        grade: letter_grade(percent),
        pass: percent >= PASS_PERCENT,
        scored_count,
        absent_count,
    }
}
