mod transfer_test;
