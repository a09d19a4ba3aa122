mod classifier;

pub use classifier::{Classification, Classifier, TableRef, TypeMask};
