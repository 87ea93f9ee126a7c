//! Annotation values with change markers

use std::collections::BTreeMap;

/// Change marker carried by every store object and annotation value
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Status {
    /// Unchanged since the last successful commit
    #[default]
    Empty,
    Added,
    Modified,
    Deleted,
}

/// A string value together with its change marker
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StringW {
    pub value: String,
    pub status: Status,
}

impl StringW {
    pub fn new<S: Into<String>>(value: S, status: Status) -> Self {
        Self {
            value: value.into(),
            status,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.status == Status::Deleted
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Annotations(BTreeMap<String, StringW>);

impl Annotations {
    /// Build a fresh annotation bag where every value is marked `Added`
    pub fn added(values: &BTreeMap<String, String>) -> Self {
        Self(
            values
                .iter()
                .map(|(k, v)| (k.clone(), StringW::new(v.clone(), Status::Added)))
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&StringW> {
        self.0.get(key)
    }

    pub fn insert<K: Into<String>>(&mut self, key: K, value: StringW) {
        self.0.insert(key.into(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &StringW)> {
        self.0.iter()
    }

    /// Replace the values with `values`, marking each key added, modified or
    /// deleted relative to the current content. Returns whether anything changed.
    pub fn update(&mut self, values: &BTreeMap<String, String>) -> bool {
        let mut changed = false;
        for (key, current) in self.0.iter_mut() {
            if !values.contains_key(key) && current.status != Status::Deleted {
                current.status = Status::Deleted;
                changed = true;
            }
        }
        for (key, value) in values {
            match self.0.get_mut(key) {
                Some(current) if current.value == *value && !current.is_deleted() => {}
                Some(current) => {
                    current.value = value.clone();
                    current.status = Status::Modified;
                    changed = true;
                }
                None => {
                    self.0
                        .insert(key.clone(), StringW::new(value.clone(), Status::Added));
                    changed = true;
                }
            }
        }
        changed
    }

    /// Mark every value deleted, keeping it until the next clean
    pub fn mark_deleted(&mut self) {
        for value in self.0.values_mut() {
            value.status = Status::Deleted;
        }
    }

    /// Drop deleted values and reset the remaining markers
    pub fn clean(&mut self) {
        self.0.retain(|_, v| !v.is_deleted());
        for value in self.0.values_mut() {
            value.status = Status::Empty;
        }
    }
}

/// First non-empty value of `name` across `sources`, in order of precedence
pub fn get_value_from_annotations<'a>(
    name: &str,
    sources: &[&'a Annotations],
) -> Option<&'a StringW> {
    sources
        .iter()
        .filter_map(|annotations| annotations.get(name))
        .find(|value| !value.value.is_empty())
}
