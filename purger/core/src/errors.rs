use std::fmt;

/// A list of errors rendered as a single bulleted message.
///
/// ```text
/// 2 errors occurred:
/// 	* first
/// 	* second
///
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MultiError(Vec<String>);

impl MultiError {
    pub fn push(&mut self, error: impl ToString) {
        self.0.push(error.to_string());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() == 1 {
            writeln!(f, "1 error occurred:")?;
        } else {
            writeln!(f, "{} errors occurred:", self.0.len())?;
        }
        for error in &self.0 {
            writeln!(f, "\t* {error}")?;
        }
        writeln!(f)
    }
}

impl std::error::Error for MultiError {}

impl<S: ToString> FromIterator<S> for MultiError {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(iter.into_iter().map(|s| s.to_string()).collect())
    }
}
