#![forbid(unsafe_code)]

pub mod select;
pub mod state;

pub mod ids {
    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    pub struct TaskId(String);

    impl TaskId {
        pub fn as_str(&self) -> &str {
            &self.0
        }

        pub fn into_string(self) -> String {
            self.0
        }

        pub fn try_new(value: impl Into<String>) -> Result<Self, TaskIdError> {
            let value = value.into();
            validate_task_id(&value)?;
            Ok(Self(value))
        }
    }

    impl std::fmt::Display for TaskId {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(&self.0)
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum TaskIdError {
        Empty,
        TooLong,
        InvalidChar { ch: char, index: usize },
    }

    impl std::fmt::Display for TaskIdError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::Empty => write!(f, "task id must not be empty"),
                Self::TooLong => write!(f, "task id must be at most 128 chars"),
                Self::InvalidChar { ch, index } => {
                    write!(f, "task id has invalid char {ch:?} at index {index}")
                }
            }
        }
    }

    impl std::error::Error for TaskIdError {}

    fn validate_task_id(value: &str) -> Result<(), TaskIdError> {
        if value.is_empty() {
            return Err(TaskIdError::Empty);
        }
        if value.len() > 128 {
            return Err(TaskIdError::TooLong);
        }
        for (index, ch) in value.chars().enumerate() {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-' | ':') {
                continue;
            }
            return Err(TaskIdError::InvalidChar { ch, index });
        }
        Ok(())
    }

}
