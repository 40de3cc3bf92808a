mod verify_test;
