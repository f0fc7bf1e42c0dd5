use candev::Error;
use candev::driver::ControllerError;
use futures_executor::block_on;

mod common;
use common::*;

#[test]
fn test_setup_and_shutdown_called_once_per_session() {
    let (dev, state) = leak_dev::<false, 4, 4, 2>();
    assert_eq!(state.borrow().reset_calls, 1);
    assert_eq!(state.borrow().setup_calls, 0);

    block_on(async {
        let port = dev.open(false).await.unwrap();
        assert_eq!(state.borrow().setup_calls, 1);
        assert!(state.borrow().rx_int);

        // further opens only count references
        let port2 = dev.open(false).await.unwrap();
        assert_eq!(state.borrow().setup_calls, 1);

        port2.close().await.unwrap();
        assert_eq!(state.borrow().shutdown_calls, 0);
        assert!(state.borrow().rx_int);

        port.close().await.unwrap();
        assert_eq!(state.borrow().shutdown_calls, 1);
        assert!(!state.borrow().rx_int);
    });
}

#[test]
fn test_reopen_returns_an_empty_device() {
    let (dev, state) = leak_dev::<false, 4, 4, 2>();

    block_on(async {
        let port = dev.open(false).await.unwrap();
        dev.receive(data_frame(0x1, &[1])).unwrap();
        dev.receive(data_frame(0x2, &[2])).unwrap();
        port.close().await.unwrap();

        // unread frames from the previous session are gone
        let mut port = dev.open(true).await.unwrap();
        assert_eq!(state.borrow().setup_calls, 2);
        let mut buf = [0u8; 32];
        assert_eq!(port.read(&mut buf).await, Err(Error::WouldBlock));
        port.close().await.unwrap();
    });
}

#[test]
fn test_open_count_saturates() {
    let (dev, state) = leak_dev::<false, 4, 4, 2>();

    block_on(async {
        let mut handles = Vec::new();
        for _ in 0..255 {
            handles.push(dev.open(false).await.unwrap());
        }
        assert_eq!(dev.open(false).await.err(), Some(Error::TooManyOpens));

        // the failed open did not disturb the session
        assert_eq!(state.borrow().setup_calls, 1);
        for handle in handles {
            handle.close().await.unwrap();
        }
        assert_eq!(state.borrow().shutdown_calls, 1);
    });
}

#[test]
fn test_setup_failure_leaves_device_closed() {
    let (dev, state) = leak_dev::<false, 4, 4, 2>();
    state.borrow_mut().setup_result = Err(ControllerError::Io);

    block_on(async {
        assert_eq!(
            dev.open(false).await.err(),
            Some(Error::Controller(ControllerError::Io))
        );
        assert!(!state.borrow().rx_int);

        // the device recovers once the hardware does
        state.borrow_mut().setup_result = Ok(());
        let port = dev.open(false).await.unwrap();
        assert_eq!(state.borrow().setup_calls, 2);
        port.close().await.unwrap();
    });
}

#[test]
fn test_ioctl_forwards_to_controller() {
    let (dev, state) = leak_dev::<false, 4, 4, 2>();

    block_on(async {
        let mut port = dev.open(false).await.unwrap();
        port.ioctl(0x1234, 99).unwrap();
        assert_eq!(state.borrow().ioctls, vec![(0x1234, 99)]);
        port.close().await.unwrap();
    });
}
