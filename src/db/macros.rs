//! Database dispatch macros for reducing code duplication.
//!
//! The sqlx-backed connection keeps one concrete connection type per backend
//! so every column type decodes natively. These macros expand the per-backend
//! match arms at compile time.

/// Macro for generating database dispatch match arms over a
/// [`RawConnection`](crate::db::driver::RawConnection).
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(conn, {
///     MySql(c) => do_mysql(c),
///     Postgres(c) => do_postgres(c),
///     SQLite(c) => do_sqlite(c),
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($conn:expr, { $($variant:ident($c:ident) => $body:expr),+ $(,)? }) => {
        match $conn {
            $(
                $crate::db::driver::RawConnection::$variant($c) => $body,
            )+
        }
    };
}

pub use impl_db_dispatch;
