use crate::util::{be_bytes_to_int, int_to_be_bytes};
use crate::{Result, Status};

/// Resolves a group of values sharing one key while skip list files are merged.
///
/// Values arrive in source order: the current value in the database being synchronized
/// first, then the merged files in the order they were given. Keys found in a single source
/// keep their value as is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reducer {
    /// Keep the first value.
    First,
    /// Keep the second value, or the first if there is only one.
    Second,
    /// Keep the last value.
    #[default]
    Last,
    /// Keep the byte-wise smallest value.
    Min,
    /// Keep the byte-wise largest value.
    Max,
    /// Concatenate all values.
    Concat,
    /// Concatenate with NUL separators.
    ConcatNull,
    /// Concatenate with tab separators.
    ConcatTab,
    /// Concatenate with newline separators.
    ConcatLine,
    /// Sum of the values read as decimal integers.
    Total,
    /// Sum of the values read as 8-byte big-endian integers.
    TotalBigEndian,
}

impl Reducer {
    /// Reduces a non-empty group to one value.
    pub fn reduce(self, values: Vec<Vec<u8>>) -> Vec<u8> {
        match self {
            Reducer::First => values.into_iter().next().unwrap_or_default(),
            Reducer::Second => {
                let mut iter = values.into_iter();
                let first = iter.next().unwrap_or_default();
                iter.next().unwrap_or(first)
            }
            Reducer::Last => values.into_iter().last().unwrap_or_default(),
            Reducer::Min => values.into_iter().min().unwrap_or_default(),
            Reducer::Max => values.into_iter().max().unwrap_or_default(),
            Reducer::Concat => values.concat(),
            Reducer::ConcatNull => values.join(&b'\0'),
            Reducer::ConcatTab => values.join(&b'\t'),
            Reducer::ConcatLine => values.join(&b'\n'),
            Reducer::Total => {
                let total = values.iter().fold(0i64, |acc, value| {
                    let text = String::from_utf8_lossy(value);
                    acc.wrapping_add(text.trim().parse::<i64>().unwrap_or(0))
                });
                total.to_string().into_bytes()
            }
            Reducer::TotalBigEndian => {
                let total = values
                    .iter()
                    .fold(0i64, |acc, value| acc.wrapping_add(be_bytes_to_int(value)));
                int_to_be_bytes(total).to_vec()
            }
        }
    }
}

impl Reducer {
    fn by_name(name: &str) -> Option<Reducer> {
        match name {
            "first" => Some(Reducer::First),
            "second" => Some(Reducer::Second),
            "last" => Some(Reducer::Last),
            "min" => Some(Reducer::Min),
            "max" => Some(Reducer::Max),
            "concat" => Some(Reducer::Concat),
            "concatnull" | "concatwithnull" => Some(Reducer::ConcatNull),
            "concattab" | "concatwithtab" => Some(Reducer::ConcatTab),
            "concatline" | "concatwithline" => Some(Reducer::ConcatLine),
            "total" => Some(Reducer::Total),
            "totalbe" | "totalbigendian" => Some(Reducer::TotalBigEndian),
            _ => None,
        }
    }
}

/// Accepts the bare names (`last`, `concat_tab`) and the prefixed forms (`ReduceToLast`,
/// `ReduceConcatWithTab`), case-insensitively. There is no "none" reducer.
impl TryFrom<String> for Reducer {
    type Error = Status;

    fn try_from(value: String) -> Result<Self> {
        let lowered = value.trim().to_ascii_lowercase().replace('_', "");
        let name = lowered.strip_prefix("reduce").unwrap_or(&lowered);
        Reducer::by_name(name)
            .or_else(|| name.strip_prefix("to").and_then(Reducer::by_name))
            .ok_or_else(|| Status::invalid_argument(format!("unknown reducer: {}", value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(values: &[&str]) -> Vec<Vec<u8>> {
        values.iter().map(|value| value.as_bytes().to_vec()).collect()
    }

    #[test]
    fn selection() {
        let values = group(&["b", "c", "a"]);
        assert_eq!(b"b".to_vec(), Reducer::First.reduce(values.clone()));
        assert_eq!(b"c".to_vec(), Reducer::Second.reduce(values.clone()));
        assert_eq!(b"a".to_vec(), Reducer::Last.reduce(values.clone()));
        assert_eq!(b"a".to_vec(), Reducer::Min.reduce(values.clone()));
        assert_eq!(b"c".to_vec(), Reducer::Max.reduce(values));
        assert_eq!(b"x".to_vec(), Reducer::Second.reduce(group(&["x"])));
    }

    #[test]
    fn combination() {
        let values = group(&["1", "20", "-3"]);
        assert_eq!(b"120-3".to_vec(), Reducer::Concat.reduce(values.clone()));
        assert_eq!(b"1\t20\t-3".to_vec(), Reducer::ConcatTab.reduce(values.clone()));
        assert_eq!(b"18".to_vec(), Reducer::Total.reduce(values));
        let values = vec![int_to_be_bytes(5).to_vec(), int_to_be_bytes(-2).to_vec()];
        assert_eq!(int_to_be_bytes(3).to_vec(), Reducer::TotalBigEndian.reduce(values));
    }

    #[test]
    fn names() {
        assert_eq!(Reducer::Last, Reducer::try_from("ReduceToLast".to_string()).unwrap());
        assert_eq!(
            Reducer::ConcatLine,
            Reducer::try_from("concat_line".to_string()).unwrap()
        );
        assert_eq!(Reducer::TotalBigEndian, Reducer::try_from("total_be".to_string()).unwrap());
        assert_eq!(Reducer::Concat, Reducer::try_from("ReduceConcat".to_string()).unwrap());
        assert_eq!(
            Reducer::ConcatNull,
            Reducer::try_from("ReduceConcatWithNull".to_string()).unwrap()
        );
        assert_eq!(
            Reducer::ConcatTab,
            Reducer::try_from("ReduceConcatWithTab".to_string()).unwrap()
        );
        assert_eq!(
            Reducer::ConcatLine,
            Reducer::try_from("ReduceConcatWithLine".to_string()).unwrap()
        );
        assert_eq!(Reducer::First, Reducer::try_from("ReduceToFirst".to_string()).unwrap());
        assert_eq!(Reducer::Total, Reducer::try_from("ReduceToTotal".to_string()).unwrap());
        assert_eq!(Reducer::Total, Reducer::try_from("total".to_string()).unwrap());
        assert!(Reducer::try_from("average".to_string()).is_err());
        assert!(Reducer::try_from("none".to_string()).is_err());
        assert!(Reducer::try_from("ReduceToNone".to_string()).is_err());
    }
}
