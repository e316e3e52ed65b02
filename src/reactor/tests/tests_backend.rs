#[cfg(test)]
mod tests {
    use crate::reactor::backend::SelectBackend;
    use crate::reactor::{READABLE, Reactor, ReactorError};
    use tracing::Level;
    use tracing_subscriber::fmt::Subscriber;

    fn init_tracing() {
        let _ = Subscriber::builder()
            .with_max_level(Level::TRACE)
            .try_init();
    }

    #[test]
    fn test_default_backend_on_linux_is_epoll() {
        init_tracing();

        let reactor = Reactor::new(64).unwrap();
        #[cfg(target_os = "linux")]
        assert_eq!(reactor.backend_name(), "epoll");
        #[cfg(not(target_os = "linux"))]
        assert_eq!(reactor.backend_name(), "select");
    }

    #[test]
    fn test_select_backend_is_pluggable() {
        init_tracing();

        let reactor = Reactor::with_backend(64, Box::new(SelectBackend::new())).unwrap();
        assert_eq!(reactor.backend_name(), "select");
    }

    #[test]
    fn test_register_rejects_fd_out_of_range() {
        init_tracing();

        let mut reactor = Reactor::new(8).unwrap();
        let result = reactor.register_file(64, READABLE, Reactor::file_handler(|_, _, _| {}));
        assert!(matches!(
            result,
            Err(ReactorError::FdOutOfRange { fd: 64, set_size: 8 })
        ));
    }

    #[test]
    fn test_select_backend_caps_set_size() {
        init_tracing();

        let result = Reactor::with_backend(libc::FD_SETSIZE + 1, Box::new(SelectBackend::new()));
        assert!(matches!(
            result,
            Err(ReactorError::SetSizeTooLarge { .. })
        ));
    }

    #[test]
    fn test_resize_set_size_grows_and_rejects_below_maxfd() {
        init_tracing();

        let mut reactor = Reactor::new(8).unwrap();
        reactor.resize_set_size(128).unwrap();
        assert_eq!(reactor.set_size(), 128);

        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (r, w) = (fds[0], fds[1]);

        reactor
            .register_file(r, READABLE, Reactor::file_handler(|_, _, _| {}))
            .unwrap();
        let too_small = (r as usize).min(1);
        assert!(matches!(
            reactor.resize_set_size(too_small),
            Err(ReactorError::SetSizeBelowFd { .. })
        ));

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_file_mask_reflects_registrations() {
        init_tracing();

        let mut reactor = Reactor::new(64).unwrap();
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (r, w) = (fds[0], fds[1]);

        assert_eq!(reactor.file_mask(r), crate::reactor::NONE);
        reactor
            .register_file(r, READABLE, Reactor::file_handler(|_, _, _| {}))
            .unwrap();
        assert_eq!(reactor.file_mask(r), READABLE);

        reactor.unregister_file(r, READABLE);
        assert_eq!(reactor.file_mask(r), crate::reactor::NONE);

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
