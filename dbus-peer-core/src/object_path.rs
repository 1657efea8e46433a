use core::fmt;

/// An error constructing or validating an [`ObjectPath`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct ObjectPathError;

impl fmt::Display for ObjectPathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid D-Bus object path")
    }
}

impl std::error::Error for ObjectPathError {}

/// A validated, borrowed D-Bus object path, e.g. `/org/freedesktop/DBus`.
#[derive(PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ObjectPath {
    inner: str,
}

impl ObjectPath {
    /// The root object path, `/`.
    pub const ROOT: &'static ObjectPath = ObjectPath::new_const("/");

    /// Validate and wrap a string as an [`ObjectPath`].
    ///
    /// # Examples
    ///
    /// ```
    /// use dbus_peer_core::ObjectPath;
    ///
    /// assert!(ObjectPath::new("/org/freedesktop/DBus").is_ok());
    /// assert!(ObjectPath::new("/").is_ok());
    /// assert!(ObjectPath::new("").is_err());
    /// assert!(ObjectPath::new("/org/freedesktop/").is_err());
    /// assert!(ObjectPath::new("org/freedesktop").is_err());
    /// assert!(ObjectPath::new("/org//freedesktop").is_err());
    /// ```
    pub fn new(s: &str) -> Result<&ObjectPath, ObjectPathError> {
        validate(s)?;
        // SAFETY: `ObjectPath` is `repr(transparent)` over `str`.
        Ok(unsafe { &*(s as *const str as *const ObjectPath) })
    }

    /// Wrap a string known to be valid at compile time. Only used for the
    /// built-in constants on this type.
    #[doc(hidden)]
    pub const fn new_const(s: &'static str) -> &'static ObjectPath {
        // SAFETY: see `new`; only used for the `ROOT` constant above.
        unsafe { &*(s as *const str as *const ObjectPath) }
    }

    /// The string representation of this object path.
    pub fn as_str(&self) -> &str {
        &self.inner
    }

    /// Iterate over the `/`-separated elements of this path, excluding the
    /// root `/` itself.
    pub fn elements(&self) -> impl Iterator<Item = &str> {
        self.inner.split('/').filter(|s| !s.is_empty())
    }
}

impl fmt::Debug for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectPath({:?})", self.inner)
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner)
    }
}

impl ToOwned for ObjectPath {
    type Owned = ObjectPathBuf;

    fn to_owned(&self) -> ObjectPathBuf {
        ObjectPathBuf {
            inner: self.inner.to_owned(),
        }
    }
}

/// An owned, validated D-Bus object path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectPathBuf {
    inner: String,
}

impl ObjectPathBuf {
    /// Validate and take ownership of a string as an object path.
    pub fn new(s: impl Into<String>) -> Result<ObjectPathBuf, ObjectPathError> {
        let inner = s.into();
        validate(&inner)?;
        Ok(ObjectPathBuf { inner })
    }
}

impl core::ops::Deref for ObjectPathBuf {
    type Target = ObjectPath;

    fn deref(&self) -> &ObjectPath {
        // SAFETY: `ObjectPathBuf` only ever holds strings that passed `validate`.
        unsafe { &*(self.inner.as_str() as *const str as *const ObjectPath) }
    }
}

impl fmt::Display for ObjectPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

/// Validate the slash-separated, `[A-Za-z0-9_]` element grammar, with the
/// single-character root `/` permitted as a special case.
fn validate(s: &str) -> Result<(), ObjectPathError> {
    if s == "/" {
        return Ok(());
    }

    if !s.starts_with('/') || s.ends_with('/') || s.is_empty() {
        return Err(ObjectPathError);
    }

    for element in s[1..].split('/') {
        if element.is_empty() {
            return Err(ObjectPathError);
        }

        if !element
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            return Err(ObjectPathError);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_paths() {
        assert!(ObjectPath::new("/").is_ok());
        assert!(ObjectPath::new("/org/freedesktop/DBus").is_ok());
        assert!(ObjectPath::new("/a1/_b2").is_ok());
    }

    #[test]
    fn rejects_invalid_paths() {
        assert!(ObjectPath::new("").is_err());
        assert!(ObjectPath::new("org/freedesktop").is_err());
        assert!(ObjectPath::new("/org/freedesktop/").is_err());
        assert!(ObjectPath::new("/org//freedesktop").is_err());
        assert!(ObjectPath::new("/org/free-desktop").is_err());
    }
}
